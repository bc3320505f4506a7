//! Identity plugins
//!
//! `origin`/`plain` protocol and `plain` obfs: every callback keeps its
//! default implementation, so data passes through untouched.

use super::{ObfsPlugin, ProtocolPlugin};

pub struct PlainProtocol;

impl ProtocolPlugin for PlainProtocol {}

pub struct PlainObfs;

impl ObfsPlugin for PlainObfs {}
