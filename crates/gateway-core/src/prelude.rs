pub use std::fmt::{Debug, Display};
pub use std::pin::Pin;
pub use std::sync::Arc;
pub use std::task::{Context, Poll, ready};
pub use std::time::{Duration, Instant};

pub use anyhow::Context as _;
pub use bytes::Bytes;
pub use tracing::{debug, error, info, trace, warn};

pub use crate::strng;
pub use crate::strng::Strng;
