use std::{borrow::Cow, io};

use crate::{
    Deserialize, Serialize,
    specs::{
        auth::AuthSpec,
        step::{ForwardSpec, StepReport, StepSpec},
    },
};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

type CountType = u64;
const COUNT_SIZE: usize = size_of::<CountType>();

const ERR_H: Header = 0;
const CONTROL_H: Header = 1;
const GRAD_H: Header = 2;
const PARAMS_H: Header = 3;
const DELTA_H: Header = 4;
const SHARD_H: Header = 5;
const OUTPUTS_H: Header = 6;

/// The payload data for the `Data` variant of the `Msg` enum.
#[derive(Debug, PartialEq)]
pub enum Payload<'a> {
    /// A worker's gradient for the shard it just processed.
    Gradient(&'a [f32]),
    /// A complete copy of a model's parameters.
    Params(&'a [f32]),
    /// The parameters that changed since the previous version, as absolute values.
    Delta {
        indices: &'a [u32],
        values: &'a [f32],
    },
    /// Row-major samples of a shard.
    Shard(&'a [f32]),
    /// Row-major model outputs for the inputs of a forward pass.
    Outputs(&'a [f32]),
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Hello(AuthSpec),
    Welcome { worker: String },
    Ping { nonce: u64 },
    Pong { nonce: u64 },
    Step(StepSpec),
    Forward(ForwardSpec),
    /// Answers both `Step` and `Forward`.
    StepDone(StepReport),
    /// Drop the replica of `model_id`, the orchestrator won't use it again.
    Release { model_id: String },
    Released { model_id: String },
    Disconnect,
}

/// The application layer message for the entire system.
#[derive(Debug, PartialEq)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    /// A short name of the message kind, meant for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(Command::Hello(_)) => "control/hello",
            Msg::Control(Command::Welcome { .. }) => "control/welcome",
            Msg::Control(Command::Ping { .. }) => "control/ping",
            Msg::Control(Command::Pong { .. }) => "control/pong",
            Msg::Control(Command::Step(_)) => "control/step",
            Msg::Control(Command::Forward(_)) => "control/forward",
            Msg::Control(Command::StepDone(_)) => "control/step_done",
            Msg::Control(Command::Release { .. }) => "control/release",
            Msg::Control(Command::Released { .. }) => "control/released",
            Msg::Control(Command::Disconnect) => "control/disconnect",
            Msg::Data(Payload::Gradient(_)) => "data/gradient",
            Msg::Data(Payload::Params(_)) => "data/params",
            Msg::Data(Payload::Delta { .. }) => "data/delta",
            Msg::Data(Payload::Shard(_)) => "data/shard",
            Msg::Data(Payload::Outputs(_)) => "data/outputs",
            Msg::Err(_) => "err",
        }
    }

    fn buf_is_too_small<T>(size: usize, needed: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {needed} bytes"),
        ))
    }

    fn invalid_kind<T>(kind: Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid kind header {kind}"),
        ))
    }

    fn cast<'b, T: bytemuck::Pod>(bytes: &'b [u8]) -> io::Result<&'b [T]> {
        bytemuck::try_cast_slice(bytes).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed numeric section of {} bytes: {e}", bytes.len()),
            )
        })
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

                // Writing into a `Vec` can't fail and `Command` derives `Serialize`
                // without any map, so encoding never errors.
                serde_json::to_writer(buf, cmd).unwrap();
                None
            }
            Msg::Data(Payload::Delta { indices, values }) => {
                buf.extend_from_slice(&DELTA_H.to_be_bytes());
                buf.extend_from_slice(&(indices.len() as CountType).to_be_bytes());
                buf.extend_from_slice(bytemuck::cast_slice::<u32, u8>(*indices));
                Some(bytemuck::cast_slice::<f32, u8>(*values))
            }
            Msg::Data(payload) => {
                let (kind, nums) = match payload {
                    Payload::Gradient(grad) => (GRAD_H, *grad),
                    Payload::Params(params) => (PARAMS_H, *params),
                    Payload::Shard(rows) => (SHARD_H, *rows),
                    Payload::Outputs(outputs) => (OUTPUTS_H, *outputs),
                    Payload::Delta { .. } => unreachable!(),
                };

                buf.extend_from_slice(&kind.to_be_bytes());
                Some(bytemuck::cast_slice(nums))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len(), HEADER_SIZE);
        }

        let (kind_buf, rest) = buf.split_at(HEADER_SIZE);

        // SAFETY: We splitted the buffer to be of size `HEADER_SIZE` just above.
        let kind = Header::from_be_bytes(kind_buf.try_into().unwrap());

        match kind {
            ERR_H => {
                let string = std::str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            CONTROL_H => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            GRAD_H => Ok(Self::Data(Payload::Gradient(Self::cast(rest)?))),
            PARAMS_H => Ok(Self::Data(Payload::Params(Self::cast(rest)?))),
            SHARD_H => Ok(Self::Data(Payload::Shard(Self::cast(rest)?))),
            OUTPUTS_H => Ok(Self::Data(Payload::Outputs(Self::cast(rest)?))),
            DELTA_H => {
                if rest.len() < COUNT_SIZE {
                    return Self::buf_is_too_small(buf.len(), HEADER_SIZE + COUNT_SIZE);
                }

                let (count_buf, rest) = rest.split_at(COUNT_SIZE);

                // SAFETY: We splitted the buffer to be of size `COUNT_SIZE` just above.
                let count = CountType::from_be_bytes(count_buf.try_into().unwrap()) as usize;

                let split = count
                    .checked_mul(size_of::<u32>())
                    .filter(|&split| split <= rest.len())
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("delta announces {count} indices but carries {} bytes", rest.len()),
                        )
                    })?;

                let (indices, values) = rest.split_at(split);
                let indices: &[u32] = Self::cast(indices)?;
                let values: &[f32] = Self::cast(values)?;

                if indices.len() != values.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "delta has {} indices but {} values",
                            indices.len(),
                            values.len()
                        ),
                    ));
                }

                Ok(Self::Data(Payload::Delta { indices, values }))
            }
            other => Self::invalid_kind(other),
        }
    }
}
