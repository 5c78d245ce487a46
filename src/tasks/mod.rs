// GelSense HILS - Long-running tasks
//
// Each task is a plain function run on its own named thread.

pub mod hub;
pub mod inference;
pub mod session;
