#![forbid(unsafe_code)]

extern crate self as twinrpc;

pub use twinrpc_macro::service;

mod error;
pub use error::{Error, ErrorKind, Result};

mod endpoint;
pub use endpoint::{EndPoint, EndPointProvider};

mod config;
pub use config::{ChannelConfig, WaterMark};

mod msg;
pub use msg::{Message, MsgFlags, MsgMeta};

mod frame;
pub use frame::{ArgReader, Format, Frame, Hello, ServiceRequest, ServiceResponse};

mod task_supervisor;
pub use task_supervisor::TaskSupervisor;

mod connection;
pub use connection::{ConnState, Connection, FrameHandler};

mod invocation;
pub use invocation::{InFlightRequest, InvocationManager};

mod registry;
pub use registry::{BoundService, Method, MethodFuture, ServiceRegistry};

pub mod services;

mod context;
pub use context::Context;

mod peer;
pub use peer::{Invoker, Peer, RemoteService};

mod listener;
pub use listener::Listener;

mod client;
pub use client::ClientChannel;

mod server;
pub use server::ServerChannel;
