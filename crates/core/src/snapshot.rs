//! Snapshot ring buffer, bracket lookup, and the pose channel that turns a
//! stream of snapshots into a smoothed, render-clock-driven pose.

use std::collections::VecDeque;

use glam::{Quat, Vec3};

use crate::types::Pose3;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Entry {
    time: f64,
    seq: u16,
    pose: Pose3,
}

/// Bounded ring of time-ordered pose snapshots. `seq != 0` switches the
/// strictly-increasing check to wrap-aware sequence order; `seq == 0`
/// (the common case for snapshots with no sequence number at all) falls
/// back to time order.
#[derive(Debug, Clone)]
pub struct SnapshotBuffer {
    entries: VecDeque<Entry>,
    capacity: usize,
}

fn seq_less_than(a: u16, b: u16) -> bool {
    let diff = b.wrapping_sub(a);
    diff != 0 && diff < 0x8000
}

impl SnapshotBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { entries: VecDeque::with_capacity(capacity.max(2)), capacity: capacity.max(2) }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn latest(&self) -> Option<(f64, u16, Pose3)> {
        self.entries.back().map(|e| (e.time, e.seq, e.pose))
    }

    /// Appends the snapshot if it is strictly newer than the last entry.
    /// Returns `false` (and leaves the buffer untouched) on duplicate or
    /// out-of-order input.
    pub fn add(&mut self, time: f64, seq: u16, pose: Pose3) -> bool {
        if let Some(last) = self.entries.back() {
            let is_newer = if seq != 0 && last.seq != 0 {
                seq_less_than(last.seq, seq)
            } else {
                time > last.time
            };
            if !is_newer {
                return false;
            }
        }

        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(Entry { time, seq, pose });
        true
    }

    pub fn reset_with(&mut self, time: f64, seq: u16, pose: Pose3) {
        self.entries.clear();
        self.entries.push_back(Entry { time, seq, pose });
    }

    /// Returns `(from_idx, to_idx, u)` bracketing `t`. Indices are positions
    /// within the buffer's current contents (`0..len()`).
    pub fn try_get_bracket(&self, t: f64) -> Option<(usize, usize, f64)> {
        if self.entries.is_empty() {
            return None;
        }
        if self.entries.len() == 1 {
            return Some((0, 0, 0.0));
        }

        if t <= self.entries[0].time {
            return Some((0, 0, 0.0));
        }
        let last = self.entries.len() - 1;
        if t >= self.entries[last].time {
            return Some((last - 1, last, 1.0));
        }

        for i in 0..last {
            let a = &self.entries[i];
            let b = &self.entries[i + 1];
            if t >= a.time && t <= b.time {
                let span = b.time - a.time;
                let u = if span > 0.0 { (t - a.time) / span } else { 0.0 };
                return Some((i, i + 1, u));
            }
        }
        Some((last - 1, last, 1.0))
    }

    fn entry(&self, idx: usize) -> &Entry {
        &self.entries[idx]
    }
}

/// Per-channel smoothing tuning. See SPEC_FULL §4.3.
#[derive(Debug, Clone, Copy)]
pub struct PoseChannelSettings {
    pub max_extrapolation_seconds: f64,
    pub enable_second_phase_smoothing: bool,
    pub tau_min_seconds: f64,
    pub tau_max_seconds: f64,
    pub speed_for_tau_min: f64,
    pub angular_speed_for_tau_min: f64,
    pub teleport_distance_meters: f64,
    pub teleport_angle_degrees: f64,
    pub max_reasonable_speed: f64,
    pub max_reasonable_angular_speed: f64,
}

impl Default for PoseChannelSettings {
    fn default() -> Self {
        Self {
            max_extrapolation_seconds: 0.25,
            enable_second_phase_smoothing: true,
            tau_min_seconds: 0.02,
            tau_max_seconds: 0.15,
            speed_for_tau_min: 2.0,
            angular_speed_for_tau_min: 180.0,
            teleport_distance_meters: 2.0,
            teleport_angle_degrees: 120.0,
            max_reasonable_speed: 20.0,
            max_reasonable_angular_speed: 1080.0,
        }
    }
}

/// One snapshot buffer plus smoothing state, bound to a single tracked part
/// (head, a hand, a virtual, or the physical torso).
#[derive(Debug, Clone)]
pub struct PoseChannel {
    buffer: SnapshotBuffer,
    settings: PoseChannelSettings,
    current: Option<Pose3>,
}

fn lerp_unclamped(a: Vec3, b: Vec3, u: f64) -> Vec3 {
    a + (b - a) * (u as f32)
}

fn slerp_unclamped(a: Quat, b: Quat, u: f64) -> Quat {
    // glam's slerp already extrapolates sanely for u outside [0, 1].
    a.slerp(b, u as f32)
}

impl PoseChannel {
    pub fn new(capacity: usize, settings: PoseChannelSettings) -> Self {
        Self { buffer: SnapshotBuffer::new(capacity), settings, current: None }
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.current = None;
    }

    pub fn current(&self) -> Option<Pose3> {
        self.current
    }

    /// Adds a snapshot, normalizing its rotation and applying the teleport
    /// reset rule first.
    pub fn add_snapshot(&mut self, time: f64, seq: u16, mut pose: Pose3) {
        pose.rotation = if pose.rotation.length_squared() < 1e-12 { Quat::IDENTITY } else { pose.rotation.normalize() };

        let reference = self.buffer.latest().map(|(_, _, p)| p).or(self.current);
        if let Some(prev) = reference {
            let dist = (pose.position - prev.position).length() as f64;
            let angle = prev.rotation.angle_between(pose.rotation).to_degrees() as f64;

            let prev_time = self.buffer.latest().map(|(t, _, _)| t).unwrap_or(time);
            let dt = (time - prev_time).max(1e-6);
            let speed = dist / dt;
            let angular_speed = angle / dt;

            let is_teleport = dist > self.settings.teleport_distance_meters
                || angle > self.settings.teleport_angle_degrees
                || speed > self.settings.max_reasonable_speed
                || angular_speed > self.settings.max_reasonable_angular_speed;

            if is_teleport {
                self.buffer.reset_with(time, seq, pose);
                self.current = Some(pose);
                return;
            }
        }

        self.buffer.add(time, seq, pose);
    }

    /// Samples the buffer against the render clock and applies second-phase
    /// low-pass smoothing, returning the pose to apply this tick.
    pub fn tick(&mut self, render_server_time: f64, dt: f64) -> Option<Pose3> {
        let target = self.sample(render_server_time)?;

        let next = match self.current {
            None => target,
            Some(current) => {
                if self.settings.enable_second_phase_smoothing {
                    self.smooth(current, target, dt)
                } else {
                    target
                }
            }
        };

        self.current = Some(next);
        Some(next)
    }

    fn sample(&self, render_server_time: f64) -> Option<Pose3> {
        if self.buffer.is_empty() {
            return None;
        }

        let (from, to, mut u) = self.buffer.try_get_bracket(render_server_time)?;
        let a = *self.buffer.entry(from);
        let b = *self.buffer.entry(to);

        if from == to {
            // Before the first sample, or only one sample present: hold it.
            return Some(a.pose);
        }

        let span = b.time - a.time;
        let beyond = render_server_time - b.time;
        if render_server_time > b.time && span > 0.0 {
            if beyond > self.settings.max_extrapolation_seconds {
                return Some(b.pose);
            }
            u = 1.0 + beyond / span;
        }

        Some(Pose3 {
            position: lerp_unclamped(a.pose.position, b.pose.position, u),
            rotation: slerp_unclamped(a.pose.rotation, b.pose.rotation, u),
        })
    }

    fn smooth(&self, current: Pose3, target: Pose3, dt: f64) -> Pose3 {
        let linear_speed = (target.position - current.position).length() as f64 / dt.max(1e-6);
        let angular_speed = current.rotation.angle_between(target.rotation).to_degrees() as f64 / dt.max(1e-6);

        let t = (linear_speed / self.settings.speed_for_tau_min)
            .max(angular_speed / self.settings.angular_speed_for_tau_min)
            .clamp(0.0, 1.0);
        let tau = self.settings.tau_max_seconds + (self.settings.tau_min_seconds - self.settings.tau_max_seconds) * t;
        let alpha = 1.0 - (-dt / tau.max(1e-6)).exp();

        Pose3 {
            position: lerp_unclamped(current.position, target.position, alpha),
            rotation: slerp_unclamped(current.rotation, target.rotation, alpha).normalize(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pose(x: f32) -> Pose3 {
        Pose3 { position: Vec3::new(x, 0.0, 0.0), rotation: Quat::IDENTITY }
    }

    #[test]
    fn add_rejects_non_increasing() {
        let mut buf = SnapshotBuffer::new(4);
        assert!(buf.add(1.0, 1, pose(0.0)));
        assert!(!buf.add(1.0, 1, pose(1.0)));
        assert!(!buf.add(0.5, 0, pose(1.0)));
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn capacity_drops_oldest() {
        let mut buf = SnapshotBuffer::new(2);
        buf.add(1.0, 0, pose(0.0));
        buf.add(2.0, 0, pose(1.0));
        buf.add(3.0, 0, pose(2.0));
        assert_eq!(buf.len(), 2);
        let (t, _, _) = buf.latest().unwrap();
        assert_eq!(t, 3.0);
    }

    #[test]
    fn bracket_before_first_and_after_last() {
        let mut buf = SnapshotBuffer::new(4);
        buf.add(1.0, 0, pose(0.0));
        buf.add(2.0, 0, pose(1.0));

        assert_eq!(buf.try_get_bracket(0.0), Some((0, 0, 0.0)));
        let (from, to, u) = buf.try_get_bracket(1.5).unwrap();
        assert_eq!((from, to), (0, 1));
        assert!((u - 0.5).abs() < 1e-9);
    }

    #[test]
    fn channel_interpolates_linearly_without_smoothing() {
        let mut settings = PoseChannelSettings::default();
        settings.enable_second_phase_smoothing = false;
        let mut ch = PoseChannel::new(8, settings);
        ch.add_snapshot(0.0, 1, pose(0.0));
        ch.add_snapshot(1.0, 2, pose(10.0));

        let result = ch.tick(0.5, 0.016).unwrap();
        assert!((result.position.x - 5.0).abs() < 1e-4);
    }

    #[test]
    fn channel_holds_beyond_extrapolation_window() {
        let mut settings = PoseChannelSettings::default();
        settings.enable_second_phase_smoothing = false;
        settings.max_extrapolation_seconds = 0.1;
        let mut ch = PoseChannel::new(8, settings);
        ch.add_snapshot(0.0, 1, pose(0.0));
        ch.add_snapshot(1.0, 2, pose(10.0));

        let result = ch.tick(2.0, 0.016).unwrap();
        assert_eq!(result.position.x, 10.0);
    }

    #[test]
    fn teleport_resets_buffer() {
        let mut ch = PoseChannel::new(8, PoseChannelSettings::default());
        ch.add_snapshot(0.0, 0, pose(0.0));
        ch.add_snapshot(0.1, 0, pose(0.01));
        ch.add_snapshot(0.2, 0, pose(5.0));

        assert_eq!(ch.current().unwrap().position.x, 5.0);
    }
}
