use crate::commands::executable::Executable;
use crate::commands::{CommandError, CommandParser};
use crate::frame::Frame;
use crate::store::Store;

// https://redis.io/commands/get
#[derive(Debug, PartialEq)]
pub struct Get {
    pub key: String,
}

impl Executable for Get {
    fn exec(self, store: &Store) -> Frame {
        match store.get(&self.key) {
            // An empty value and an absent key share the null bulk reply;
            // values carry no existence tag separate from their length.
            Some(value) if !value.is_empty() => Frame::Bulk(value),
            _ => Frame::Null,
        }
    }
}

impl TryFrom<&mut CommandParser> for Get {
    type Error = CommandError;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let key = parser.next_string()?;
        parser.finish()?;

        Ok(Self { key })
    }
}
