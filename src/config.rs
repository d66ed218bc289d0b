//! Read-only loop configuration.

use std::net::SocketAddr;

use crate::constants::NO_ZERO_COPY;
use crate::error::{TransportError, TransportResult};

/// Whether an accepted connection's delegate runs on the loop thread
/// (`Inline`) or is handed off for the application to pick up
/// (`Dispatch`) — spec.md §9 "Asynchronous accept queue".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplicationSchedulingMode {
    Inline,
    Dispatch,
}

#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub aio_receive: bool,
    pub aio_send: bool,
    pub defer_send: bool,
    pub defer_accept: bool,
    pub receive_on_incoming_cpu: bool,
    pub zero_copy: bool,
    pub zero_copy_threshold: usize,
    pub application_scheduling_mode: ApplicationSchedulingMode,
    pub cpu_id: Option<usize>,
    pub listen_addr: SocketAddr,
}

impl TransportConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            aio_receive: false,
            aio_send: false,
            defer_send: false,
            defer_accept: false,
            receive_on_incoming_cpu: false,
            zero_copy: false,
            zero_copy_threshold: NO_ZERO_COPY,
            application_scheduling_mode: ApplicationSchedulingMode::Dispatch,
            cpu_id: None,
            listen_addr,
        }
    }

    /// Validated at `ThreadContext` construction time:
    /// a `ZeroCopy` request with no threshold set is almost certainly a
    /// misconfiguration, not a silent no-op.
    pub fn validate(&self) -> TransportResult<()> {
        if self.zero_copy && self.zero_copy_threshold == NO_ZERO_COPY {
            return Err(TransportError::Config(
                "ZeroCopy enabled but ZeroCopyThreshold is NoZeroCopy".into(),
            ));
        }
        if self.receive_on_incoming_cpu && self.cpu_id.is_none() {
            return Err(TransportError::Config(
                "ReceiveOnIncomingCpu requires CpuId to be set".into(),
            ));
        }
        Ok(())
    }

    pub fn effective_zero_copy_threshold(&self) -> usize {
        if self.zero_copy {
            self.zero_copy_threshold
        } else {
            NO_ZERO_COPY
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn zero_copy_without_threshold_is_rejected() {
        let mut cfg = TransportConfig::new(addr());
        cfg.zero_copy = true;
        assert!(cfg.validate().is_err());
        cfg.zero_copy_threshold = 1024;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn incoming_cpu_without_cpu_id_is_rejected() {
        let mut cfg = TransportConfig::new(addr());
        cfg.receive_on_incoming_cpu = true;
        assert!(cfg.validate().is_err());
        cfg.cpu_id = Some(3);
        assert!(cfg.validate().is_ok());
    }
}
