use std::{borrow::Cow, io};

use crate::{Deserialize, ReduceOp, Serialize};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

const ERR_H: Header = 0;
const CONTROL_H: Header = 1;
const DATA_H: Header = 2;

/// The kind of collective a worker is about to take part in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    AllGather,
    ReduceScatter { op: ReduceOp, shard_count: usize },
    AllReduce { op: ReduceOp },
}

impl OpKind {
    /// Returns a static name for this collective, used in error reports.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::AllGather => "all_gather",
            OpKind::ReduceScatter { .. } => "reduce_scatter",
            OpKind::AllReduce { .. } => "all_reduce",
        }
    }
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Hello { rank: usize, world_size: usize },
    Collective { kind: OpKind, len: usize },
    Disconnect,
}

/// The application layer message exchanged between the workers of a group.
#[derive(Debug)]
pub enum Msg<'a> {
    Control(Command),
    Data(&'a [f32]),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    /// Returns a static name for this message's kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(Command::Hello { .. }) => "control/hello",
            Msg::Control(Command::Collective { .. }) => "control/collective",
            Msg::Control(Command::Disconnect) => "control/disconnect",
            Msg::Data(_) => "data",
            Msg::Err(_) => "err",
        }
    }

    fn buf_is_too_small<T>(size: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {HEADER_SIZE} bytes"),
        ))
    }

    fn invalid_kind_byte<T>(kind: Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid kind header {kind}"),
        ))
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&ERR_H.to_be_bytes());
                Some(e.as_bytes())
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL_H.to_be_bytes());

                // SAFETY: Serialize impl for `Command` is derived and not implemented
                //         by hand. Nor has a non string-key map inside.
                serde_json::to_writer(buf, cmd).unwrap();
                None
            }
            Msg::Data(nums) => {
                buf.extend_from_slice(&DATA_H.to_be_bytes());
                Some(bytemuck::cast_slice(nums))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a mut [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len());
        }

        let (kind_buf, rest) = buf.split_at_mut(HEADER_SIZE);
        let mut header = [0; HEADER_SIZE];
        header.copy_from_slice(kind_buf);
        let rest: &'a [u8] = rest;

        match Header::from_be_bytes(header) {
            ERR_H => {
                let string = str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            CONTROL_H => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            DATA_H => {
                let nums = bytemuck::try_cast_slice(rest).map_err(|err| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("{err:?}"))
                })?;

                Ok(Self::Data(nums))
            }
            kind => Self::invalid_kind_byte(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<F: FnOnce(Msg<'_>)>(msg: &Msg<'_>, check: F) {
        let mut buf = Vec::new();
        let zero_copy = msg.serialize(&mut buf);
        if let Some(data) = zero_copy {
            buf.extend_from_slice(data);
        }

        // Mimic the receiver, which reads into a 4 byte aligned buffer.
        let mut aligned = vec![0f32; buf.len().div_ceil(4)];
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut aligned);
        let bytes = &mut bytes[..buf.len()];
        bytes.copy_from_slice(&buf);

        check(Msg::deserialize(bytes).unwrap());
    }

    #[test]
    fn data_keeps_values() {
        let nums: [f32; 3] = [1.0, -2.5, 3.25];
        roundtrip(&Msg::Data(&nums), |msg| match msg {
            Msg::Data(got) => assert_eq!(got, &nums[..]),
            other => panic!("unexpected msg: {other:?}"),
        });
    }

    #[test]
    fn control_keeps_command() {
        let cmd = Command::Collective {
            kind: OpKind::ReduceScatter {
                op: ReduceOp::Sum,
                shard_count: 4,
            },
            len: 12,
        };

        roundtrip(&Msg::Control(cmd), |msg| match msg {
            Msg::Control(got) => assert_eq!(got, cmd),
            other => panic!("unexpected msg: {other:?}"),
        });
    }

    #[test]
    fn rejects_unknown_header() {
        let mut buf = 9u32.to_be_bytes();
        assert!(Msg::deserialize(&mut buf).is_err());
    }
}
