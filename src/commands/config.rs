use crate::commands::executable::Executable;
use crate::commands::{CommandError, CommandParser};
use crate::frame::Frame;
use crate::store::Store;

// Configuration is not exposed over the wire; the empty-array reply keeps
// generic clients that probe CONFIG on connect happy.
#[derive(Debug, PartialEq)]
pub struct Config;

impl Executable for Config {
    fn exec(self, _store: &Store) -> Frame {
        Frame::Array(vec![])
    }
}

impl TryFrom<&mut CommandParser> for Config {
    type Error = CommandError;

    fn try_from(_parser: &mut CommandParser) -> Result<Self, Self::Error> {
        // Any subcommand and argument list is accepted and ignored.
        Ok(Self {})
    }
}
