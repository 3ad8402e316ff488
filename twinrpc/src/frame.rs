use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    error::{Error, ErrorKind, Result},
    msg::{Message, MsgFlags, MsgMeta},
};

/// Serialization format of argument and return values.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    #[default]
    MessagePack,
}

impl Format {
    fn from_flags(flags: MsgFlags) -> Self {
        if flags.contains(MsgFlags::UseMessagePack) {
            Format::MessagePack
        } else {
            Format::Json
        }
    }

    fn flags(self) -> MsgFlags {
        match self {
            Format::Json => MsgFlags::empty(),
            Format::MessagePack => MsgFlags::UseMessagePack,
        }
    }

    /// # Errors
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Bytes> {
        let bytes = match self {
            Format::Json => serde_json::to_vec(value)
                .map_err(|e| Error::new(ErrorKind::SerializeFailed, e.to_string()))?,
            Format::MessagePack => rmp_serde::to_vec_named(value)?,
        };
        Ok(bytes.into())
    }

    /// Decodes a value. An empty buffer decodes as null.
    ///
    /// # Errors
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        if bytes.is_empty() {
            Ok(serde_json::from_value(serde_json::Value::Null)?)
        } else {
            match self {
                Format::Json => Ok(serde_json::from_slice(bytes)?),
                Format::MessagePack => Ok(rmp_serde::from_slice(bytes)?),
            }
        }
    }
}

/// First frame a client sends on a fresh connection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    pub txid: u64,
    pub service: String,
    pub method: String,
    pub args: Vec<Bytes>,
    pub oneway: bool,
    pub format: Format,
}

impl ServiceRequest {
    #[must_use]
    pub fn arg_reader(&self) -> ArgReader<'_> {
        ArgReader {
            args: self.args.iter(),
            format: self.format,
            index: 0,
        }
    }

    fn encode_args(&self) -> Result<Bytes> {
        let size = self.args.iter().map(|a| a.len() + 4).sum::<usize>() + 4;
        let mut payload = BytesMut::with_capacity(size);
        payload.put_u32(u32::try_from(self.args.len())?);
        for arg in &self.args {
            payload.put_u32(u32::try_from(arg.len())?);
            payload.put_slice(arg);
        }
        Ok(payload.freeze())
    }

    fn decode_args(mut payload: Bytes) -> Result<Vec<Bytes>> {
        if payload.is_empty() {
            return Ok(vec![]);
        }
        let truncated = || Error::new(ErrorKind::ParseFailed, "truncated argument list".into());
        if payload.remaining() < 4 {
            return Err(truncated());
        }
        let argc = payload.get_u32() as usize;
        let mut args = Vec::with_capacity(argc.min(64));
        for _ in 0..argc {
            if payload.remaining() < 4 {
                return Err(truncated());
            }
            let len = payload.get_u32() as usize;
            if payload.remaining() < len {
                return Err(truncated());
            }
            args.push(payload.split_to(len));
        }
        Ok(args)
    }
}

/// Sequential decoder over the arguments of a request.
pub struct ArgReader<'a> {
    args: std::slice::Iter<'a, Bytes>,
    format: Format,
    index: usize,
}

impl ArgReader<'_> {
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the request carries fewer arguments
    /// than the method declares.
    pub fn next_arg<T: DeserializeOwned>(&mut self) -> Result<T> {
        let Some(raw) = self.args.next() else {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("missing argument #{}", self.index),
            ));
        };
        let index = self.index;
        self.index += 1;
        self.format.decode(raw).map_err(|e| {
            Error::new(
                ErrorKind::InvalidArgument,
                format!("argument #{index}: {e}"),
            )
        })
    }

    /// # Errors
    ///
    /// Returns `InvalidArgument` when arguments are left over.
    pub fn finish(self) -> Result<()> {
        let left = self.args.len();
        if left > 0 {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("{left} unexpected extra argument(s)"),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceResponse {
    pub txid: u64,
    pub format: Format,
    pub outcome: Result<Bytes>,
}

impl ServiceResponse {
    pub(crate) fn ok(request: &ServiceRequest, value: Bytes) -> Self {
        Self {
            txid: request.txid,
            format: request.format,
            outcome: Ok(value),
        }
    }

    pub(crate) fn err(request: &ServiceRequest, err: Error) -> Self {
        Self {
            txid: request.txid,
            format: request.format,
            outcome: Err(err),
        }
    }

    /// Decodes the return value, or yields the remote error.
    ///
    /// # Errors
    pub fn decode<T: DeserializeOwned>(self) -> Result<T> {
        let value = self.outcome?;
        self.format.decode(&value)
    }
}

/// Everything that travels over a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Hello(Hello),
    Request(ServiceRequest),
    Response(ServiceResponse),
}

impl Frame {
    /// # Errors
    pub fn encode(&self) -> Result<Bytes> {
        let msg = match self {
            Frame::Hello(hello) => Message::new(
                MsgMeta {
                    flags: MsgFlags::IsHello,
                    ..Default::default()
                },
                Format::Json.encode(hello)?,
            ),
            Frame::Request(req) => {
                let mut flags = MsgFlags::IsReq | req.format.flags();
                if req.oneway {
                    flags |= MsgFlags::OneWay;
                }
                Message::new(
                    MsgMeta {
                        service: req.service.clone(),
                        method: req.method.clone(),
                        flags,
                        txid: req.txid,
                    },
                    req.encode_args()?,
                )
            }
            Frame::Response(rsp) => {
                let mut flags = MsgFlags::IsRsp | rsp.format.flags();
                let payload = match &rsp.outcome {
                    Ok(value) => value.clone(),
                    Err(err) => {
                        flags |= MsgFlags::IsErr;
                        rsp.format.encode(err)?
                    }
                };
                Message::new(
                    MsgMeta {
                        flags,
                        txid: rsp.txid,
                        ..Default::default()
                    },
                    payload,
                )
            }
        };
        msg.encode()
    }

    /// Decodes a message body as produced by [`crate::msg::parse_frame`].
    ///
    /// # Errors
    pub fn decode(body: Bytes) -> Result<Self> {
        let Message { meta, payload } = Message::parse(body)?;
        let format = Format::from_flags(meta.flags);

        if meta.is_hello() {
            Ok(Frame::Hello(Format::Json.decode(&payload)?))
        } else if meta.is_req() {
            Ok(Frame::Request(ServiceRequest {
                txid: meta.txid,
                service: meta.service,
                method: meta.method,
                args: ServiceRequest::decode_args(payload)?,
                oneway: meta.flags.contains(MsgFlags::OneWay),
                format,
            }))
        } else if meta.is_rsp() {
            let outcome = if meta.flags.contains(MsgFlags::IsErr) {
                let err = format.decode::<Error>(&payload).unwrap_or_else(|_| {
                    Error::remote_fault(String::from_utf8_lossy(&payload))
                });
                Err(err)
            } else {
                Ok(payload)
            };
            Ok(Frame::Response(ServiceResponse {
                txid: meta.txid,
                format,
                outcome,
            }))
        } else {
            Err(Error::new(
                ErrorKind::ParseFailed,
                format!("unknown msg flags: {:?}", meta.flags),
            ))
        }
    }
}
