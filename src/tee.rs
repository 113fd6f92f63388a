//! Generic TEE client session handling.
//!
//! A [`TeeClient`] is the transport to a trusted application: open a
//! context, open a session against the TA's UUID, invoke numbered commands
//! with four parameters. [`TeeSession`] owns one such client and adds the
//! lifecycle rules both HDCP back-ends share (idempotent open and close,
//! bounded open attempts) and the dual status check on every invoke.

use std::io;

use uuid::Uuid;

use crate::error::{Error, Result};

pub const TEE_SUCCESS: u32 = 0;
pub const TEE_ERROR_NOT_SUPPORTED: u32 = 0xFFFF_000A;

/// Number of times a session may be opened over the life of a handle.
pub const MAX_TA_INIT_RETRY_CNT: u32 = 2;

/// One invoke parameter slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TeeParam {
    #[default]
    None,
    /// In/out value pair.
    Value { a: u64, b: u64 },
    /// In/out shared memory. `size` is the length declared to the TA and may
    /// differ from `buf.len()`.
    Memref { buf: Vec<u8>, size: usize },
}

impl TeeParam {
    #[must_use]
    pub fn value(a: u64, b: u64) -> Self {
        TeeParam::Value { a, b }
    }

    #[must_use]
    pub fn memref(data: &[u8]) -> Self {
        TeeParam::Memref {
            buf: data.to_vec(),
            size: data.len(),
        }
    }

    #[must_use]
    pub fn memref_with_size(data: &[u8], size: usize) -> Self {
        TeeParam::Memref {
            buf: data.to_vec(),
            size,
        }
    }

    #[must_use]
    pub fn value_a(&self) -> Option<u64> {
        match self {
            TeeParam::Value { a, .. } => Some(*a),
            _ => None,
        }
    }

    #[must_use]
    pub fn value_b(&self) -> Option<u64> {
        match self {
            TeeParam::Value { b, .. } => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn buffer(&self) -> Option<&[u8]> {
        match self {
            TeeParam::Memref { buf, .. } => Some(buf),
            _ => None,
        }
    }
}

/// Result of opening a TA session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenedSession {
    pub session: u32,
    /// Return code reported by the TA.
    pub ret: u32,
}

/// Transport to a trusted application.
///
/// Every call reports two layers: an `Err` when the transport itself failed,
/// otherwise the TA's own return code.
pub trait TeeClient: Send {
    fn open_context(&mut self) -> io::Result<()>;
    fn open_session(&mut self, uuid: &Uuid) -> io::Result<OpenedSession>;
    fn invoke(&mut self, session: u32, func: u32, params: &mut [TeeParam; 4]) -> io::Result<u32>;
    fn close_session(&mut self, session: u32);
    fn close_context(&mut self);
}

/// Error kinds a [`TeeSession`] reports for its lifecycle failures.
#[derive(Debug, Clone, Copy)]
pub struct SessionErrors {
    pub open_context: Error,
    pub open_session: Error,
    pub not_initialized: Error,
    pub no_memory: Error,
}

/// An owned, lazily opened TA session.
pub struct TeeSession<C> {
    client: C,
    name: &'static str,
    uuid: Uuid,
    session: Option<u32>,
    attempts: u32,
    errors: SessionErrors,
}

impl<C: TeeClient> TeeSession<C> {
    pub fn new(client: C, name: &'static str, uuid: Uuid, errors: SessionErrors) -> Self {
        Self {
            client,
            name,
            uuid,
            session: None,
            attempts: 0,
            errors,
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    /// Open context and session. No-op when already open.
    pub fn open(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        if self.attempts >= MAX_TA_INIT_RETRY_CNT {
            return Err(self.errors.not_initialized);
        }
        self.attempts += 1;

        info!("{} open context", self.name);
        self.client.open_context().map_err(|e| {
            error!("{} open context fail: {e}", self.name);
            self.errors.open_context
        })?;

        info!("{} open session", self.name);
        match self.client.open_session(&self.uuid) {
            Ok(opened) if opened.ret == TEE_SUCCESS => {
                self.session = Some(opened.session);
                info!("{} init done", self.name);
                Ok(())
            }
            Ok(opened) => {
                error!("{} open session fail, ret={:#x}", self.name, opened.ret);
                self.client.close_context();
                Err(self.errors.open_session)
            }
            Err(e) => {
                error!("{} open session fail: {e}", self.name);
                self.client.close_context();
                Err(self.errors.open_session)
            }
        }
    }

    /// Close session and context. No-op when not open.
    pub fn close(&mut self) {
        if let Some(session) = self.session.take() {
            info!("{} close session", self.name);
            self.client.close_session(session);
            self.client.close_context();
            info!("{} deinit done", self.name);
        }
    }

    /// Allocate a zeroed shared buffer parameter.
    pub fn shared(&self, len: usize) -> Result<TeeParam> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| self.errors.no_memory)?;
        buf.resize(len, 0);
        Ok(TeeParam::Memref { buf, size: len })
    }

    /// Invoke `func`. Either a transport failure or a nonzero TA return code
    /// maps to `err`.
    pub fn invoke(&mut self, func: u32, params: &mut [TeeParam; 4], err: Error) -> Result<()> {
        let ret = self.invoke_raw(func, params, err)?;
        if ret != TEE_SUCCESS {
            error!("{} command {func:#x} fail, ret={ret:#x}", self.name);
            return Err(err);
        }
        Ok(())
    }

    /// Invoke `func` and hand back the TA return code. Only a transport
    /// failure maps to `err`.
    pub fn invoke_raw(&mut self, func: u32, params: &mut [TeeParam; 4], err: Error) -> Result<u32> {
        let session = self.session.ok_or(self.errors.not_initialized)?;
        self.client.invoke(session, func, params).map_err(|e| {
            error!("{} command {func:#x} transport fail: {e}", self.name);
            err
        })
    }
}
