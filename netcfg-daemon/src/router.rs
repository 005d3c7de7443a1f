// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Decodes one inbound command frame, dispatches on the verb and serializes
//! the reply envelope.

use std::cell::RefCell;

use tracing::debug;

use crate::netops::NetworkOps;
use crate::sexpr;

pub struct CommandRouter {
    ops: RefCell<NetworkOps>,
}

impl CommandRouter {
    pub fn new(ops: NetworkOps) -> Self {
        CommandRouter {
            ops: RefCell::new(ops),
        }
    }

    pub fn ops(&self) -> &RefCell<NetworkOps> {
        &self.ops
    }

    /// One response frame per command frame. The verb is echoed back in the
    /// envelope; a frame that does not decode at all answers with the
    /// literal `error` verb. Arity is exact: extra tokens are as invalid as
    /// missing ones.
    pub fn dispatch(&self, frame: &[u8]) -> String {
        let tokens = sexpr::decode(frame);
        if tokens.is_empty() {
            debug!("undecodable command frame ({} bytes)", frame.len());
            return sexpr::encode("error", "invalid S-expression format");
        }

        let verb = tokens[0].as_str();
        let mut ops = self.ops.borrow_mut();
        let body = match (verb, tokens.len()) {
            ("enumerate", 1) => ops.enumerate(),
            ("on", 2) => ops.enable(&tokens[1]),
            ("off", 2) => ops.disable(&tokens[1]),
            ("dhcpOn", 2) => ops.dhcp_on(&tokens[1]),
            ("dhcpOff", 2) => ops.dhcp_off(&tokens[1]),
            ("setStatic", 5) => ops.set_static(&tokens[1], &tokens[2], &tokens[3], &tokens[4]),
            _ => "error(unknown command or invalid arguments)".to_string(),
        };
        sexpr::encode(verb, &body)
    }
}
