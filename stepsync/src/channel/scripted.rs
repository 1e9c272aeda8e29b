//! In-memory channel for deterministic tests and simulation.
//!
//! A [`ScriptedConnector`] hands out [`ScriptedChannel`]s that share one
//! script: replies queued by the test (or produced by a responder hook when a
//! request is sent) are returned by `try_recv` in order, regardless of the
//! wait argument. Nothing blocks and no time passes.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use super::{Connector, RequestChannel};
use crate::net::{ServiceAddress, SocketError};
use crate::protocol::{Reply, Request};

type Responder = Box<dyn FnMut(&Request) -> Option<Reply>>;

#[derive(Default)]
struct Script {
    replies: VecDeque<Reply>,
    sent: Vec<Request>,
    responder: Option<Responder>,
    connects: usize,
    open: usize,
    generation: u64,
    refuse_connect: bool,
    fail_io: bool,
}

/// Shared handle to a script. Clones observe and drive the same script.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    script: Rc<RefCell<Script>>,
}

impl ScriptedConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a reply for the currently open channel.
    pub fn push_reply(&self, reply: Reply) {
        self.script.borrow_mut().replies.push_back(reply);
    }

    /// Installs a hook that may produce a reply for every request sent.
    pub fn respond_with(&self, responder: impl FnMut(&Request) -> Option<Reply> + 'static) {
        self.script.borrow_mut().responder = Some(Box::new(responder));
    }

    /// Makes subsequent `connect` calls fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.script.borrow_mut().refuse_connect = refuse;
    }

    /// Makes send and receive on open channels fail with a transport error.
    pub fn fail_io(&self, fail: bool) {
        self.script.borrow_mut().fail_io = fail;
    }

    /// Every request sent so far, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<Request> {
        self.script.borrow().sent.clone()
    }

    /// Replies queued but not yet received.
    #[must_use]
    pub fn pending_replies(&self) -> usize {
        self.script.borrow().replies.len()
    }

    /// Number of successful `connect` calls.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.script.borrow().connects
    }

    /// Number of channels currently open.
    #[must_use]
    pub fn open_channels(&self) -> usize {
        self.script.borrow().open
    }
}

impl Connector for ScriptedConnector {
    type Channel = ScriptedChannel;

    fn connect(&self, _address: ServiceAddress) -> Result<ScriptedChannel, SocketError> {
        let mut script = self.script.borrow_mut();
        if script.refuse_connect {
            return Err(SocketError::Io(io::ErrorKind::ConnectionRefused.into()));
        }
        script.connects += 1;
        script.open += 1;
        // Replies meant for an earlier channel never reach a new one.
        script.replies.clear();
        script.generation += 1;
        Ok(ScriptedChannel {
            script: Rc::clone(&self.script),
            generation: script.generation,
        })
    }
}

/// One channel opened by a [`ScriptedConnector`].
pub struct ScriptedChannel {
    script: Rc<RefCell<Script>>,
    generation: u64,
}

impl ScriptedChannel {
    fn is_current(&self, script: &Script) -> bool {
        script.generation == self.generation
    }
}

impl RequestChannel for ScriptedChannel {
    fn send(&mut self, request: &Request) -> Result<(), SocketError> {
        let mut guard = self.script.borrow_mut();
        let script = &mut *guard;
        if script.fail_io {
            return Err(SocketError::Disconnected);
        }
        script.sent.push(request.clone());
        if let Some(responder) = script.responder.as_mut()
            && let Some(reply) = responder(request)
        {
            script.replies.push_back(reply);
        }
        Ok(())
    }

    fn try_recv(&mut self, _wait: Duration) -> Result<Option<Reply>, SocketError> {
        let mut script = self.script.borrow_mut();
        if script.fail_io {
            return Err(SocketError::Disconnected);
        }
        if !self.is_current(&script) {
            return Ok(None);
        }
        Ok(script.replies.pop_front())
    }
}

impl Drop for ScriptedChannel {
    fn drop(&mut self) {
        if let Ok(mut script) = self.script.try_borrow_mut() {
            script.open = script.open.saturating_sub(1);
        }
    }
}
