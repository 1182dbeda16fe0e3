// Command scheduler interface
//
// The cache does not own a queue. It records transfer work onto
// whatever command stream its caller is building and occasionally
// forces a submit + wait to order the levels of the update chain.
//
// Austin Shafer - 2024

use crate::Result;

/// Opaque command buffer token minted by a scheduler and understood
/// by the platform that records into it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommandBuffer(pub u64);

/// One logical command stream.
///
/// `submit` hands everything recorded so far to the device, `wait`
/// blocks until the last submit completed. `after_submit` callbacks
/// run once the current batch has been handed off, which is where
/// transient resources get parked until the GPU is done with them.
pub trait Scheduler: Send {
    /// The command buffer currently being recorded.
    fn get_command_buffer(&mut self) -> CommandBuffer;

    fn submit(&mut self) -> Result<()>;

    fn wait(&mut self) -> Result<()>;

    fn after_submit(&mut self, hook: Box<dyn FnOnce() + Send>);
}
