use bytes::Bytes;

use crate::commands::executable::Executable;
use crate::commands::{CommandError, CommandParser};
use crate::frame::Frame;
use crate::store::Store;

// https://redis.io/commands/set
#[derive(Debug, PartialEq)]
pub struct Set {
    pub key: String,
    pub value: Bytes,
}

impl Executable for Set {
    fn exec(self, store: &Store) -> Frame {
        store.set(self.key, self.value);

        Frame::Simple("OK".to_string())
    }
}

impl TryFrom<&mut CommandParser> for Set {
    type Error = CommandError;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let key = parser.next_string()?;
        let value = parser.next_bytes()?;
        parser.finish()?;

        Ok(Self { key, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Command;

    #[test]
    fn wrong_arity_is_rejected() {
        let frame = Frame::Array(vec![
            Frame::Bulk(Bytes::from("SET")),
            Frame::Bulk(Bytes::from("foo")),
        ]);
        let err = Command::try_from(frame).unwrap_err();

        assert_eq!(err, CommandError::Arity);

        let frame = Frame::Array(vec![
            Frame::Bulk(Bytes::from("SET")),
            Frame::Bulk(Bytes::from("foo")),
            Frame::Bulk(Bytes::from("bar")),
            Frame::Bulk(Bytes::from("extra")),
        ]);
        let err = Command::try_from(frame).unwrap_err();

        assert_eq!(err, CommandError::Arity);
    }

    #[test]
    fn value_keeps_raw_bytes() {
        let frame = Frame::Array(vec![
            Frame::Bulk(Bytes::from("SET")),
            Frame::Bulk(Bytes::from("foo")),
            Frame::Bulk(Bytes::from_static(b"a\r\nb\t\x00c")),
        ]);
        let command = Command::try_from(frame).unwrap();

        assert_eq!(
            command,
            Command::Set(Set {
                key: "foo".to_string(),
                value: Bytes::from_static(b"a\r\nb\t\x00c"),
            })
        );
    }
}
