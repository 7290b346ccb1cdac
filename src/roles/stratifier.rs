//! Stratifier role. Only the generic control commands are served here.

use std::os::unix::net::UnixStream;

use super::RoleContext;
use super::runtime::{self, RoleService};
use crate::error::Result;

#[derive(Debug, Default)]
pub struct Stratifier;

impl RoleService for Stratifier {
    fn name(&self) -> &'static str {
        "stratifier"
    }

    fn handle(&mut self, _msg: &str, _stream: &mut UnixStream) -> bool {
        false
    }
}

pub fn run(ctx: RoleContext) -> Result<i32> {
    runtime::run(&mut Stratifier, &ctx.socket_dir, ctx.killold)
}
