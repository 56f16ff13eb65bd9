//! Receiver register access over the DDC bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hdcp_transport::{ddc, BoundedRetry, DdcBus};
use tracing::trace;

use crate::config::ReadFormat;
use crate::errors::HdcpError;
use crate::ksv;

/// The receiver's HDCP port.
///
/// Every transaction is retried on transient bus errors, and every attempt
/// first checks that the receiver is still plugged: an unplug turns the next
/// retry into [`HdcpError::LinkLost`] instead of another bus cycle.
pub struct ReceiverPort {
    bus: Arc<dyn DdcBus>,
    retry: BoundedRetry,
    plugged: Arc<AtomicBool>,
    read_format: ReadFormat,
}

impl ReceiverPort {
    pub fn new(
        bus: Arc<dyn DdcBus>,
        retry: BoundedRetry,
        plugged: Arc<AtomicBool>,
        read_format: ReadFormat,
    ) -> Self {
        Self {
            bus,
            retry,
            plugged,
            read_format,
        }
    }

    pub fn is_plugged(&self) -> bool {
        self.plugged.load(Ordering::SeqCst)
    }

    /// Fails with [`HdcpError::LinkLost`] once the receiver is gone.
    pub fn ensure_plugged(&self) -> Result<(), HdcpError> {
        if self.is_plugged() {
            Ok(())
        } else {
            Err(HdcpError::LinkLost)
        }
    }

    fn retryable(e: &HdcpError) -> bool {
        matches!(e, HdcpError::Transport(bus) if bus.is_transient())
    }

    pub async fn read(&self, offset: u8, len: usize) -> Result<Vec<u8>, HdcpError> {
        trace!(offset, len, "ddc read");
        self.retry
            .run(
                move || async move {
                    self.ensure_plugged()?;
                    let mut buf = vec![0u8; len];
                    self.bus.read(offset, &mut buf).await?;
                    Ok::<_, HdcpError>(buf)
                },
                Self::retryable,
            )
            .await
    }

    pub async fn write(&self, offset: u8, data: &[u8]) -> Result<(), HdcpError> {
        trace!(offset, len = data.len(), "ddc write");
        self.retry
            .run(
                move || async move {
                    self.ensure_plugged()?;
                    self.bus.write(offset, data).await?;
                    Ok::<_, HdcpError>(())
                },
                Self::retryable,
            )
            .await
    }

    pub async fn read_u8(&self, offset: u8) -> Result<u8, HdcpError> {
        Ok(self.read(offset, 1).await?[0])
    }

    pub async fn read_u16(&self, offset: u8) -> Result<u16, HdcpError> {
        let bytes = self.read(offset, 2).await?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Raw 40-bit KSV; callers check well-formedness.
    pub async fn read_ksv(&self, offset: u8) -> Result<u64, HdcpError> {
        let bytes = self.read(offset, ddc::KSV_LEN).await?;
        Ok(ksv::from_le_bytes(&bytes))
    }

    /// Whether Ri' reads use the short format.
    pub fn short_ri(&self) -> bool {
        self.read_format == ReadFormat::Short && self.bus.capabilities().short_read
    }

    /// The receiver's current Ri'.
    pub async fn read_ri(&self) -> Result<u16, HdcpError> {
        if !self.short_ri() {
            return self.read_u16(ddc::RI).await;
        }
        self.retry
            .run(
                move || async move {
                    self.ensure_plugged()?;
                    let mut buf = [0u8; 2];
                    self.bus.read_current(&mut buf).await?;
                    Ok::<_, HdcpError>(u16::from_le_bytes(buf))
                },
                Self::retryable,
            )
            .await
    }
}
