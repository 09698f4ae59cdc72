//! Outbound RPC: sliding-window rate limit, pre-ready pending queue with
//! TTL, and a bounded per-tick flush.

use std::collections::VecDeque;

use crate::error::Result;
use crate::wire::{self, RpcFrame};

#[derive(Debug, Clone)]
struct PendingRpc {
    function_name: String,
    arguments_json: String,
    enqueued_at: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct RpcSettings {
    pub rate_limit: u32,
    pub rate_window_secs: f64,
    pub pending_cap: usize,
    pub ttl_secs: f64,
    pub flush_per_frame: usize,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            rate_limit: 30,
            rate_window_secs: 1.0,
            pending_cap: 100,
            ttl_secs: 5.0,
            flush_per_frame: 10,
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum SendDecision {
    Sent(Vec<u8>),
    Queued,
    DroppedRateLimited,
    DroppedOversizeOrOverflow,
}

pub struct RpcChannel {
    settings: RpcSettings,
    window: VecDeque<f64>,
    pending: VecDeque<PendingRpc>,
}

impl RpcChannel {
    pub fn new(settings: RpcSettings) -> Self {
        Self { settings, window: VecDeque::new(), pending: VecDeque::new() }
    }

    fn prune_window(&mut self, now: f64) {
        while let Some(&oldest) = self.window.front() {
            if now - oldest > self.settings.rate_window_secs {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn rate_limited(&mut self, now: f64) -> bool {
        if self.settings.rate_limit == 0 {
            return false;
        }
        self.prune_window(now);
        self.window.len() as u32 >= self.settings.rate_limit
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Attempts to send immediately if `ready`; otherwise enqueues for
    /// later flush. A full pending queue drops the incoming call, and an
    /// oversize argument payload drops rather than failing the caller.
    pub fn send(
        &mut self,
        sender_client_no: u16,
        function_name: &str,
        arguments_json: &str,
        now: f64,
        ready: bool,
    ) -> Result<SendDecision> {
        if !ready {
            if self.pending.len() >= self.settings.pending_cap {
                log::warn!("rpc: pending queue full, dropping {function_name}");
                return Ok(SendDecision::DroppedOversizeOrOverflow);
            }
            self.pending.push_back(PendingRpc {
                function_name: function_name.to_string(),
                arguments_json: arguments_json.to_string(),
                enqueued_at: now,
            });
            return Ok(SendDecision::Queued);
        }

        if self.rate_limited(now) {
            log::warn!("rpc: rate limit exceeded, dropping {function_name}");
            return Ok(SendDecision::DroppedRateLimited);
        }

        let frame = RpcFrame {
            sender_client_no,
            function_name: function_name.to_string(),
            arguments_json: arguments_json.to_string(),
        };
        match wire::encode_rpc(&frame) {
            Ok(encoded) => {
                self.window.push_back(now);
                Ok(SendDecision::Sent(encoded))
            }
            Err(crate::error::NetSyncError::OversizeField { field, max, actual }) => {
                log::warn!("rpc: {function_name} dropped, oversize {field} ({actual} > {max})");
                Ok(SendDecision::DroppedOversizeOrOverflow)
            }
            Err(e) => Err(e),
        }
    }

    /// Drains up to `flush_per_frame` pending entries, dropping any whose
    /// age exceeds the TTL, stopping (without dropping the remainder) at
    /// the first rate-limit trip.
    pub fn flush_pending_if_ready(&mut self, sender_client_no: u16, now: f64) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut processed = 0;

        while processed < self.settings.flush_per_frame {
            let Some(front) = self.pending.front() else { break };

            if now - front.enqueued_at > self.settings.ttl_secs {
                log::warn!("rpc: dropping expired pending {}", front.function_name);
                self.pending.pop_front();
                processed += 1;
                continue;
            }

            if self.rate_limited(now) {
                break;
            }

            let entry = self.pending.pop_front().unwrap();
            let frame = RpcFrame {
                sender_client_no,
                function_name: entry.function_name,
                arguments_json: entry.arguments_json,
            };
            if let Ok(encoded) = wire::encode_rpc(&frame) {
                self.window.push_back(now);
                out.push(encoded);
            }
            processed += 1;
        }

        out
    }
}
