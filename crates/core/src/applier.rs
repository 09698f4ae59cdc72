//! Binds a set of pose channels to one avatar's parts and feeds it inbound
//! transforms; the per-tick smoothed result is read back out by the caller,
//! which owns whatever rendering representation exists outside this crate.

use crate::snapshot::{PoseChannel, PoseChannelSettings};
use crate::types::{ClientTransform, Pose3, PoseFlags, RoomClientEntry, MAX_VIRTUALS};

/// Smoothing settings for every part of one avatar. A single value is
/// shared by all virtuals; callers that need per-virtual tuning can swap
/// `virtuals` for distinct settings per index.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmoothingSettings {
    pub physical: PoseChannelSettings,
    pub head: PoseChannelSettings,
    pub right_hand: PoseChannelSettings,
    pub left_hand: PoseChannelSettings,
    pub virtuals: PoseChannelSettings,
}

/// Output poses for one tick, `None` where the corresponding channel has
/// never received a snapshot or was cleared (e.g. the peer went stealth).
#[derive(Debug, Clone, Default)]
pub struct AvatarPose {
    pub physical: Option<Pose3>,
    pub head: Option<Pose3>,
    pub right_hand: Option<Pose3>,
    pub left_hand: Option<Pose3>,
    pub virtuals: Vec<Option<Pose3>>,
}

/// The "avatar" transform applier mode: physical/head/hands plus a bounded
/// set of virtual transforms.
pub struct AvatarTransformApplier {
    buffer_capacity: usize,
    settings: SmoothingSettings,
    physical: PoseChannel,
    head: PoseChannel,
    right_hand: PoseChannel,
    left_hand: PoseChannel,
    virtuals: Vec<PoseChannel>,
}

impl AvatarTransformApplier {
    pub fn new(buffer_capacity: usize, settings: SmoothingSettings) -> Self {
        Self {
            buffer_capacity,
            settings,
            physical: PoseChannel::new(buffer_capacity, settings.physical),
            head: PoseChannel::new(buffer_capacity, settings.head),
            right_hand: PoseChannel::new(buffer_capacity, settings.right_hand),
            left_hand: PoseChannel::new(buffer_capacity, settings.left_hand),
            virtuals: Vec::new(),
        }
    }

    fn ensure_virtuals(&mut self, count: usize) {
        let count = count.min(MAX_VIRTUALS);
        while self.virtuals.len() < count {
            self.virtuals.push(PoseChannel::new(self.buffer_capacity, self.settings.virtuals));
        }
    }

    /// Feeds one inbound transform for this avatar's peer. Stealth clears
    /// every channel; otherwise each part is updated when its validity flag
    /// is set and cleared when it is not.
    pub fn ingest(&mut self, transform: &ClientTransform, pose_time: f64) {
        if transform.is_stealth() {
            self.clear_all();
            return;
        }
        self.ingest_parts(
            transform.flags,
            transform.pose_seq,
            pose_time,
            transform.physical,
            transform.head,
            transform.right_hand,
            transform.left_hand,
            &transform.virtuals,
        );
    }

    /// Same as [`Self::ingest`] for a room-pose-forwarded peer entry, which
    /// carries the identical set of parts without a device id.
    pub fn ingest_room_entry(&mut self, entry: &RoomClientEntry) {
        if entry.flags.contains(PoseFlags::IS_STEALTH) {
            self.clear_all();
            return;
        }
        self.ingest_parts(
            entry.flags,
            entry.pose_seq,
            entry.pose_time,
            entry.physical,
            entry.head,
            entry.right_hand,
            entry.left_hand,
            &entry.virtuals,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn ingest_parts(
        &mut self,
        flags: PoseFlags,
        pose_seq: u16,
        pose_time: f64,
        physical: Option<crate::types::PhysicalPose>,
        head: Option<Pose3>,
        right_hand: Option<Pose3>,
        left_hand: Option<Pose3>,
        virtuals: &[Pose3],
    ) {
        let flags = flags.normalized();

        if flags.contains(PoseFlags::PHYSICAL_VALID) {
            if let Some(p) = physical {
                let pose = Pose3 {
                    position: p.position,
                    rotation: glam::Quat::from_rotation_y(p.yaw_degrees.to_radians()),
                };
                self.physical.add_snapshot(pose_time, pose_seq, pose);
            }
        } else {
            self.physical.clear();
        }

        if flags.contains(PoseFlags::HEAD_VALID) {
            if let Some(pose) = head {
                self.head.add_snapshot(pose_time, pose_seq, pose);
            }
        } else {
            self.head.clear();
        }

        if flags.contains(PoseFlags::RIGHT_VALID) {
            if let Some(pose) = right_hand {
                self.right_hand.add_snapshot(pose_time, pose_seq, pose);
            }
        } else {
            self.right_hand.clear();
        }

        if flags.contains(PoseFlags::LEFT_VALID) {
            if let Some(pose) = left_hand {
                self.left_hand.add_snapshot(pose_time, pose_seq, pose);
            }
        } else {
            self.left_hand.clear();
        }

        if flags.contains(PoseFlags::VIRTUALS_VALID) {
            self.ensure_virtuals(virtuals.len());
            for (channel, pose) in self.virtuals.iter_mut().zip(virtuals.iter()) {
                channel.add_snapshot(pose_time, pose_seq, *pose);
            }
        } else {
            for channel in &mut self.virtuals {
                channel.clear();
            }
        }
    }

    pub fn clear_all(&mut self) {
        self.physical.clear();
        self.head.clear();
        self.right_hand.clear();
        self.left_hand.clear();
        for c in &mut self.virtuals {
            c.clear();
        }
    }

    pub fn tick(&mut self, render_server_time: f64, dt: f64) -> AvatarPose {
        AvatarPose {
            physical: self.physical.tick(render_server_time, dt),
            head: self.head.tick(render_server_time, dt),
            right_hand: self.right_hand.tick(render_server_time, dt),
            left_hand: self.left_hand.tick(render_server_time, dt),
            virtuals: self.virtuals.iter_mut().map(|c| c.tick(render_server_time, dt)).collect(),
        }
    }
}

/// The "single" mode: one channel, used for the secondary "human presence"
/// marker driven off the physical part.
pub struct SingleTransformApplier {
    channel: PoseChannel,
}

impl SingleTransformApplier {
    pub fn new(buffer_capacity: usize, settings: PoseChannelSettings) -> Self {
        Self { channel: PoseChannel::new(buffer_capacity, settings) }
    }

    pub fn ingest(&mut self, pose_time: f64, seq: u16, pose: Pose3) {
        self.channel.add_snapshot(pose_time, seq, pose);
    }

    pub fn clear(&mut self) {
        self.channel.clear();
    }

    pub fn tick(&mut self, render_server_time: f64, dt: f64) -> Option<Pose3> {
        self.channel.tick(render_server_time, dt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};
    use crate::types::EncodingFlags;

    fn sample(head_x: f32) -> ClientTransform {
        ClientTransform {
            device_id: "d".into(),
            client_no: 8,
            pose_time: 0.0,
            pose_seq: 1,
            flags: PoseFlags::HEAD_VALID,
            encoding_flags: EncodingFlags::default(),
            physical: None,
            head: Some(Pose3 { position: Vec3::new(head_x, 1.6, 0.0), rotation: Quat::IDENTITY }),
            right_hand: None,
            left_hand: None,
            virtuals: Vec::new(),
        }
    }

    #[test]
    fn stealth_clears_every_channel() {
        let mut applier = AvatarTransformApplier::new(8, SmoothingSettings::default());
        applier.ingest(&sample(1.0), 0.0);
        let mut stealth = sample(1.0);
        stealth.flags = PoseFlags::IS_STEALTH;
        applier.ingest(&stealth, 0.1);
        assert!(applier.head.current().is_none());
    }

    #[test]
    fn room_entry_feeds_the_same_channels_as_ingest() {
        let mut applier = AvatarTransformApplier::new(8, SmoothingSettings::default());
        let entry = RoomClientEntry {
            client_no: 8,
            pose_time: 0.0,
            pose_seq: 1,
            flags: PoseFlags::HEAD_VALID,
            encoding_flags: crate::types::EncodingFlags::default(),
            physical: None,
            head: Some(Pose3 { position: Vec3::new(1.0, 1.6, 0.0), rotation: Quat::IDENTITY }),
            right_hand: None,
            left_hand: None,
            virtuals: Vec::new(),
        };
        applier.ingest_room_entry(&entry);
        applier.tick(0.0, 0.016);
        assert!(applier.head.current().is_some());
    }

    #[test]
    fn invalid_head_clears_head_channel() {
        let mut applier = AvatarTransformApplier::new(8, SmoothingSettings::default());
        applier.ingest(&sample(1.0), 0.0);
        applier.tick(0.0, 0.016);
        assert!(applier.head.current().is_some());

        let mut t = sample(1.0);
        t.flags = PoseFlags::empty();
        applier.ingest(&t, 0.1);
        assert!(applier.head.current().is_none());
    }
}
