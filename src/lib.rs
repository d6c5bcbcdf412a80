// SPDX-License-Identifier: Apache-2.0

mod buffer;
mod clients;
mod command;
mod config;
mod daemon;
mod error;
mod event;
mod lease;
mod msg;
mod option;
mod ovpn;
mod realm;
mod requestor;
mod transaction;
mod username;
mod vpn_config;

pub use crate::config::{DaemonConfig, RealmConfig, ServerConfig};
pub use crate::daemon::{request_stop, Daemon};
pub use crate::error::{ErrorKind, VleaseError};
pub use crate::lease::DhcpV4Lease;
pub use crate::msg::DhcpV4MessageType;
pub use crate::option::ClasslessRoute;
pub use crate::realm::{resolve_realms, Realm, StaticRouteV6};
pub use crate::username::{FullUsername, UsernameParser};

pub(crate) use crate::buffer::{Buffer, BufferMut};
pub(crate) use crate::error::ErrorContext;
pub(crate) use crate::msg::DhcpV4Message;
