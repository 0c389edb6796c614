use std::{borrow::Cow, io};

type KindTag = u32;
const KIND_SIZE: usize = size_of::<KindTag>();

/// The frame kinds of the protocol, written as the first word of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum Kind {
    Err = 0,
    Control = 1,
    Contribution = 2,
    Reduced = 3,
}

impl TryFrom<KindTag> for Kind {
    type Error = io::Error;

    fn try_from(tag: KindTag) -> io::Result<Self> {
        match tag {
            0 => Ok(Self::Err),
            1 => Ok(Self::Control),
            2 => Ok(Self::Contribution),
            3 => Ok(Self::Reduced),
            tag => Err(invalid_data(format!("unknown frame kind {tag}"))),
        }
    }
}

/// The payload data for the `Data` variant of the `Msg` enum.
#[derive(Debug, PartialEq)]
pub enum Payload<'a> {
    /// A rank's local buffer sent to the root of a reduction.
    Contribution(&'a [f32]),
    /// The reduced buffer fanned back out by the root.
    Reduced(&'a [f32]),
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Join { rank: usize, world_size: usize },
    Barrier,
    Release,
    Disconnect,
}

/// A message exchanged between the ranks of a process group.
#[derive(Debug, PartialEq)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    Err(Cow<'a, str>),
}

impl<'a> Msg<'a> {
    /// Returns a stable name for the message kind, used in protocol errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(Command::Join { .. }) => "control/join",
            Msg::Control(Command::Barrier) => "control/barrier",
            Msg::Control(Command::Release) => "control/release",
            Msg::Control(Command::Disconnect) => "control/disconnect",
            Msg::Data(Payload::Contribution(_)) => "data/contribution",
            Msg::Data(Payload::Reduced(_)) => "data/reduced",
            Msg::Err(_) => "err",
        }
    }

    fn tag(&self) -> Kind {
        match self {
            Msg::Err(_) => Kind::Err,
            Msg::Control(_) => Kind::Control,
            Msg::Data(Payload::Contribution(_)) => Kind::Contribution,
            Msg::Data(Payload::Reduced(_)) => Kind::Reduced,
        }
    }

    /// Appends the kind and any owned body bytes to `head`.
    ///
    /// # Returns
    /// The borrowed part of the body, to be written right after `head`.
    pub(crate) fn encode(&'a self, head: &mut Vec<u8>) -> io::Result<&'a [u8]> {
        head.extend_from_slice(&(self.tag() as KindTag).to_be_bytes());

        match self {
            Msg::Err(e) => Ok(e.as_bytes()),
            Msg::Control(cmd) => {
                serde_json::to_writer(&mut *head, cmd)?;
                Ok(Default::default())
            }
            Msg::Data(Payload::Contribution(nums) | Payload::Reduced(nums)) => {
                Ok(bytemuck::cast_slice::<f32, u8>(nums))
            }
        }
    }

    /// Decodes a frame, borrowing float payloads and error text from it.
    ///
    /// # Arguments
    /// * `frame` - The frame without its length prefix, 4 byte aligned.
    pub(crate) fn decode(frame: &'a [u8]) -> io::Result<Self> {
        let Some((tag, body)) = frame.split_first_chunk::<KIND_SIZE>() else {
            return Err(invalid_data(format!(
                "a frame of {} bytes has no room for its kind",
                frame.len()
            )));
        };

        match Kind::try_from(KindTag::from_be_bytes(*tag))? {
            Kind::Err => {
                let text = str::from_utf8(body).map_err(|e| invalid_data(e.to_string()))?;
                Ok(Msg::Err(Cow::Borrowed(text)))
            }
            Kind::Control => Ok(Msg::Control(serde_json::from_slice(body)?)),
            kind => {
                let nums = bytemuck::try_cast_slice(body)
                    .map_err(|e| invalid_data(format!("malformed float payload: {e:?}")))?;

                let payload = match kind {
                    Kind::Contribution => Payload::Contribution(nums),
                    _ => Payload::Reduced(nums),
                };

                Ok(Msg::Data(payload))
            }
        }
    }
}

fn invalid_data(detail: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, detail)
}
