//! Generator role: the pool's link to the bitcoin daemon.

use std::os::unix::net::UnixStream;

use serde_json::Value;

use super::RoleContext;
use super::runtime::{self, RoleService, reply};
use crate::config::BtcdConfig;
use crate::error::Result;
use crate::ipc::conn::ConnSock;
use crate::rpc;

const GETBLOCKCOUNT: &str = "{\"method\": \"getblockcount\"}\n";

/// Serves `getblockcount` from the first configured daemon.
#[derive(Debug)]
pub struct Generator {
    btcd: BtcdConfig,
    /// Opened on first use so a missing daemon does not stop the pool.
    conn: Option<ConnSock>,
}

impl Generator {
    pub fn new(btcd: BtcdConfig) -> Self {
        Self { btcd, conn: None }
    }

    /// Current block height as reported by the daemon.
    pub fn block_count(&mut self) -> Option<i64> {
        let btcd = &self.btcd;
        let conn = self.conn.get_or_insert_with(|| rpc::connect_btcd(btcd));
        let val = rpc::json_rpc_call(conn, GETBLOCKCOUNT)?;
        match val.get("result") {
            Some(Value::Number(n)) => n.as_i64(),
            _ => {
                tracing::warn!(reply = %val, "No result in getblockcount reply");
                None
            }
        }
    }
}

impl RoleService for Generator {
    fn name(&self) -> &'static str {
        "generator"
    }

    fn handle(&mut self, msg: &str, stream: &mut UnixStream) -> bool {
        if !msg.starts_with("getblockcount") {
            return false;
        }
        match self.block_count() {
            Some(height) => reply(stream, &height.to_string()),
            None => reply(stream, "failed"),
        }
        true
    }
}

pub fn run(ctx: RoleContext) -> Result<i32> {
    let btcd = ctx.config.btcd.first().cloned().unwrap_or_default();
    tracing::info!(url = %btcd.url, "Generator using btcd");
    let mut generator = Generator::new(btcd);
    runtime::run(&mut generator, &ctx.socket_dir, ctx.killold)
}
