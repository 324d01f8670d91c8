use crate::error::Result;

/// The replicated state machine driven by the consensus log.
///
/// The runtime guarantees that apply() is invoked serially and in log order,
/// so implementations need no locking of their own for the apply path.
/// snapshot() may run concurrently with reads elsewhere and should hold any
/// lock briefly. Since commands have already been committed on a quorum when
/// they are applied, apply() may only fail deterministically; a
/// non-deterministic failure would diverge this replica and must panic
/// instead (the node restarts and resynchronizes from snapshot and log).
pub trait State: Send {
    /// Applies a committed command, returning the result to the submitting
    /// client. Errors are propagated to the client but do not halt the node.
    fn apply(&mut self, command: Vec<u8>) -> Result<Vec<u8>>;

    /// Returns a serialized point-in-time image of the state machine.
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replaces the state machine contents with a serialized image.
    fn restore(&mut self, data: Vec<u8>) -> Result<()>;
}

#[cfg(test)]
pub mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// A state machine that records applied commands, for node tests. The
    /// command list is shared, so tests can inspect it while the node owns
    /// the state machine.
    #[derive(Clone, Default)]
    pub struct Ledger {
        commands: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl Ledger {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn list(&self) -> Vec<Vec<u8>> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl State for Ledger {
        fn apply(&mut self, command: Vec<u8>) -> Result<Vec<u8>> {
            self.commands.lock()?.push(command.clone());
            Ok(command)
        }

        fn snapshot(&self) -> Result<Vec<u8>> {
            Ok(crate::encoding::bincode::serialize(&self.list()))
        }

        fn restore(&mut self, data: Vec<u8>) -> Result<()> {
            *self.commands.lock()? = crate::encoding::bincode::deserialize(&data)?;
            Ok(())
        }
    }
}
