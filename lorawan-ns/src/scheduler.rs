//! Receive-window scheduling
//!
//! Gateway timestamps are a free-running 32-bit microsecond counter, so all
//! window arithmetic wraps modulo 2^32. Elapsed processing time is measured
//! with [`Instant`] only.

use std::time::Instant;

use tracing::debug;

/// Microseconds per second
pub const US_PER_SECOND: u32 = 1_000_000;

/// Receive window selected for a downlink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxWindow {
    /// First receive window
    Rx1,
    /// Second receive window
    Rx2,
}

/// Both window timestamps and the one chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxWindowPlan {
    /// RX1 opening on the gateway counter
    pub rx1_tmst: u32,
    /// RX2 opening on the gateway counter
    pub rx2_tmst: u32,
    /// Window the downlink goes out in
    pub chosen: RxWindow,
}

impl RxWindowPlan {
    /// Timestamp of the chosen window
    pub fn tmst(&self) -> u32 {
        match self.chosen {
            RxWindow::Rx1 => self.rx1_tmst,
            RxWindow::Rx2 => self.rx2_tmst,
        }
    }
}

/// Compute `(rx1, rx2)` gateway timestamps for an uplink
///
/// `rx2_delay` defaults to `rx1_delay + 1`.
pub fn compute_rx_tmsts(uplink_tmst: u32, rx1_delay: u8, rx2_delay: Option<u8>) -> (u32, u32) {
    let d2 = rx2_delay.unwrap_or_else(|| rx1_delay.saturating_add(1));
    (
        uplink_tmst.wrapping_add(rx1_delay as u32 * US_PER_SECOND),
        uplink_tmst.wrapping_add(d2 as u32 * US_PER_SECOND),
    )
}

/// Pick RX1 if the downlink can be sent before RX2 opens
///
/// The current gateway time is `rx1 - rx1_delay + elapsed_us`; RX1 wins iff
/// `current + tx_us < rx2`, so the exact boundary resolves to RX2.
pub fn decide_receive_window(
    rx1_tmst: u32,
    rx2_tmst: u32,
    rx1_delay: u8,
    elapsed_us: u64,
    tx_us: u32,
) -> RxWindow {
    let uplink_tmst = rx1_tmst.wrapping_sub(rx1_delay as u32 * US_PER_SECOND);
    let rx2_offset = rx2_tmst.wrapping_sub(uplink_tmst) as u64;

    if elapsed_us.saturating_add(tx_us as u64) < rx2_offset {
        RxWindow::Rx1
    } else {
        RxWindow::Rx2
    }
}

/// Arrival of one uplink, used to time its downlink
#[derive(Debug, Clone, Copy)]
pub struct UplinkTiming {
    /// Gateway counter at reception
    pub tmst: u32,
    /// Local monotonic arrival time
    pub received_at: Instant,
}

impl UplinkTiming {
    /// Uplink received now
    pub fn now(tmst: u32) -> Self {
        Self {
            tmst,
            received_at: Instant::now(),
        }
    }

    /// Microseconds since arrival
    pub fn elapsed_us(&self) -> u64 {
        self.received_at.elapsed().as_micros() as u64
    }

    /// Compute both windows and decide between them now
    pub fn plan(&self, rx1_delay: u8, rx2_delay: Option<u8>, tx_us: u32) -> RxWindowPlan {
        let (rx1_tmst, rx2_tmst) = compute_rx_tmsts(self.tmst, rx1_delay, rx2_delay);
        let elapsed_us = self.elapsed_us();
        let chosen = decide_receive_window(rx1_tmst, rx2_tmst, rx1_delay, elapsed_us, tx_us);
        debug!(rx1_tmst, rx2_tmst, elapsed_us, tx_us, ?chosen, "receive window chosen");
        RxWindowPlan {
            rx1_tmst,
            rx2_tmst,
            chosen,
        }
    }
}
