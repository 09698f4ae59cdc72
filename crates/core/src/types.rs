//! Data model shared by the codec, snapshot channels, and router.

use bitflags::bitflags;
use glam::{Quat, Vec3};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PoseFlags: u8 {
        const IS_STEALTH       = 1 << 0;
        const PHYSICAL_VALID   = 1 << 1;
        const HEAD_VALID       = 1 << 2;
        const RIGHT_VALID      = 1 << 3;
        const LEFT_VALID       = 1 << 4;
        const VIRTUALS_VALID   = 1 << 5;
    }
}

impl PoseFlags {
    /// Clears dependent bits when `HEAD_VALID` is not set, per the wire
    /// invariant: hands and virtuals are encoded head-relative and are
    /// meaningless without a head pose.
    pub fn normalized(self) -> Self {
        if self.contains(PoseFlags::HEAD_VALID) {
            self
        } else {
            self & !(PoseFlags::RIGHT_VALID | PoseFlags::LEFT_VALID | PoseFlags::VIRTUALS_VALID)
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EncodingFlags: u8 {
        const PHYSICAL_YAW_ONLY       = 1 << 0;
        const RIGHT_HEAD_RELATIVE     = 1 << 1;
        const LEFT_HEAD_RELATIVE      = 1 << 2;
        const VIRTUALS_HEAD_RELATIVE  = 1 << 3;
    }
}

impl Default for EncodingFlags {
    fn default() -> Self {
        EncodingFlags::PHYSICAL_YAW_ONLY
            | EncodingFlags::RIGHT_HEAD_RELATIVE
            | EncodingFlags::LEFT_HEAD_RELATIVE
            | EncodingFlags::VIRTUALS_HEAD_RELATIVE
    }
}

pub const MAX_VIRTUALS: usize = 50;

/// A full 6-DOF pose: position plus unit rotation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose3 {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Pose3 {
    pub const IDENTITY: Pose3 = Pose3 { position: Vec3::ZERO, rotation: Quat::IDENTITY };
}

impl Default for Pose3 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// The "physical" (torso) part only ever carries position and a yaw angle.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PhysicalPose {
    pub position: Vec3,
    pub yaw_degrees: f32,
}

/// One participant's pose as sent or received on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientTransform {
    pub device_id: String,
    pub client_no: u16,
    pub pose_time: f64,
    pub pose_seq: u16,
    pub flags: PoseFlags,
    pub encoding_flags: EncodingFlags,
    pub physical: Option<PhysicalPose>,
    pub head: Option<Pose3>,
    pub right_hand: Option<Pose3>,
    pub left_hand: Option<Pose3>,
    pub virtuals: Vec<Pose3>,
}

impl ClientTransform {
    pub fn stealth(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            client_no: 0,
            pose_time: 0.0,
            pose_seq: 0,
            flags: PoseFlags::IS_STEALTH,
            encoding_flags: EncodingFlags::default(),
            physical: None,
            head: None,
            right_hand: None,
            left_hand: None,
            virtuals: Vec::new(),
        }
    }

    pub fn is_stealth(&self) -> bool {
        self.flags.contains(PoseFlags::IS_STEALTH)
    }
}

/// A decoded peer entry inside a [`RoomTransformSnapshot`]; identical to
/// [`ClientTransform`] minus the device id, which the receiver resolves
/// through the device/client mapping table instead.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomClientEntry {
    pub client_no: u16,
    pub pose_time: f64,
    pub pose_seq: u16,
    pub flags: PoseFlags,
    pub encoding_flags: EncodingFlags,
    pub physical: Option<PhysicalPose>,
    pub head: Option<Pose3>,
    pub right_hand: Option<Pose3>,
    pub left_hand: Option<Pose3>,
    pub virtuals: Vec<Pose3>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoomTransformSnapshot {
    pub room_id: String,
    pub broadcast_time: f64,
    pub clients: Vec<RoomClientEntry>,
}

/// Server semantic version triplet, carried in `DeviceIdMapping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl ServerVersion {
    /// `0.0.x` is treated as "unknown, accept"; otherwise `(major, minor)`
    /// must match.
    pub fn compatible_with(&self, other: ServerVersion) -> bool {
        if self.major == 0 && self.minor == 0 {
            return true;
        }
        self.major == other.major && self.minor == other.minor
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMappingEntry {
    pub client_no: u16,
    pub is_stealth: bool,
}
