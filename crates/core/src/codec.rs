//! Protocol V3: frame type bytes, pose quantization, "smallest-three"
//! quaternion compression, and the stable pose signature.
//!
//! Every decode function returns `None` on truncation, bad version, or
//! otherwise malformed input rather than an error — per the wire contract,
//! callers log and drop the frame instead of failing the connection.

use glam::{Quat, Vec3};

use crate::buffer::{ByteReader, ByteWriter};
use crate::error::Result;
use crate::types::{
    ClientTransform, EncodingFlags, PhysicalPose, Pose3, PoseFlags, RoomClientEntry,
    RoomTransformSnapshot, MAX_VIRTUALS,
};
use crate::util::fnv1a_64;

pub const PROTOCOL_VERSION: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Rpc = 3,
    DeviceIdMapping = 6,
    GlobalVarSet = 7,
    GlobalVarSync = 8,
    ClientVarSet = 9,
    ClientVarSync = 10,
    ClientPose = 11,
    RoomPose = 12,
}

impl MessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            3 => Self::Rpc,
            6 => Self::DeviceIdMapping,
            7 => Self::GlobalVarSet,
            8 => Self::GlobalVarSync,
            9 => Self::ClientVarSet,
            10 => Self::ClientVarSync,
            11 => Self::ClientPose,
            12 => Self::RoomPose,
            _ => return None,
        })
    }
}

// Quantization scales. See SPEC_FULL §4.1.
const ABS_POSITION_SCALE: f32 = 0.01;
const HEAD_RELATIVE_SCALE: f32 = 0.005;
const YAW_SCALE: f32 = 0.1;

fn quantize(v: f32, scale: f32) -> i16 {
    (v / scale).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

fn dequantize(v: i16, scale: f32) -> f32 {
    v as f32 * scale
}

fn write_vec3(w: &mut ByteWriter, v: Vec3, scale: f32) {
    w.i16(quantize(v.x, scale));
    w.i16(quantize(v.y, scale));
    w.i16(quantize(v.z, scale));
}

fn read_vec3(r: &mut ByteReader, scale: f32) -> Option<Vec3> {
    Some(Vec3::new(
        dequantize(r.i16()?, scale),
        dequantize(r.i16()?, scale),
        dequantize(r.i16()?, scale),
    ))
}

/// "Smallest-three" quaternion compression into a u32: 2 bits selecting the
/// dropped (largest-magnitude) component, then three 10-bit fields for the
/// rest, quantized over `[-1/sqrt(2), 1/sqrt(2)]`.
const QUAT_RANGE: f32 = std::f32::consts::FRAC_1_SQRT_2;

pub fn compress_quat(q: Quat) -> u32 {
    let q = if q.length_squared() < 1e-12 { Quat::IDENTITY } else { q.normalize() };
    let comps = [q.x, q.y, q.z, q.w];

    let mut largest_idx = 0usize;
    let mut largest_abs = comps[0].abs();
    for (i, &c) in comps.iter().enumerate().skip(1) {
        if c.abs() > largest_abs {
            largest_abs = c.abs();
            largest_idx = i;
        }
    }

    let sign = if comps[largest_idx] < 0.0 { -1.0 } else { 1.0 };

    let mut packed: u32 = (largest_idx as u32) << 30;
    let mut slot = 0u32;
    for (i, &c) in comps.iter().enumerate() {
        if i == largest_idx {
            continue;
        }
        let signed = c * sign;
        let normalized = (signed + QUAT_RANGE) / (2.0 * QUAT_RANGE);
        let ten_bit = (normalized.clamp(0.0, 1.0) * 1023.0).round() as u32;
        packed |= ten_bit << (slot * 10);
        slot += 1;
    }

    packed
}

pub fn decompress_quat(packed: u32) -> Quat {
    let largest_idx = (packed >> 30) as usize;
    let mut others = [0f32; 3];
    for (slot, other) in others.iter_mut().enumerate() {
        let ten_bit = (packed >> (slot * 10)) & 0x3FF;
        let normalized = ten_bit as f32 / 1023.0;
        *other = normalized * (2.0 * QUAT_RANGE) - QUAT_RANGE;
    }

    let sum_sq: f32 = others.iter().map(|c| c * c).sum();
    let largest = (1.0 - sum_sq).max(0.0).sqrt();

    let mut comps = [0f32; 4];
    let mut slot = 0;
    for (i, comp) in comps.iter_mut().enumerate() {
        if i == largest_idx {
            *comp = largest;
        } else {
            *comp = others[slot];
            slot += 1;
        }
    }

    Quat::from_xyzw(comps[0], comps[1], comps[2], comps[3]).normalize()
}

fn encode_relative_pose(w: &mut ByteWriter, pose: Pose3, head: Pose3, head_relative: bool) {
    if head_relative {
        let rel_pos = pose.position - head.position;
        let rel_rot = head.rotation.conjugate() * pose.rotation;
        write_vec3(w, rel_pos, HEAD_RELATIVE_SCALE);
        w.u32(compress_quat(rel_rot));
    } else {
        write_vec3(w, pose.position, ABS_POSITION_SCALE);
        w.u32(compress_quat(pose.rotation));
    }
}

fn decode_relative_pose(r: &mut ByteReader, head: Pose3, head_relative: bool) -> Option<Pose3> {
    let raw_pos = read_vec3(r, if head_relative { HEAD_RELATIVE_SCALE } else { ABS_POSITION_SCALE })?;
    let raw_rot = decompress_quat(r.u32()?);
    if head_relative {
        Some(Pose3 {
            position: head.position + raw_pos,
            rotation: head.rotation * raw_rot,
        })
    } else {
        Some(Pose3 { position: raw_pos, rotation: raw_rot })
    }
}

/// Encodes the pose-carrying fields common to `ClientPose` and each entry of
/// `RoomPose`: flags, encoding flags, and the valid parts. Does not write
/// the leading message type / version / id fields, which differ between the
/// two frame kinds.
fn encode_pose_fields(
    w: &mut ByteWriter,
    flags: PoseFlags,
    encoding_flags: EncodingFlags,
    physical: Option<PhysicalPose>,
    head: Option<Pose3>,
    right: Option<Pose3>,
    left: Option<Pose3>,
    virtuals: &[Pose3],
) {
    let flags = flags.normalized();
    w.u8(flags.bits());
    w.u8(encoding_flags.bits());

    if flags.contains(PoseFlags::PHYSICAL_VALID) {
        let p = physical.unwrap_or_default();
        write_vec3(w, p.position, ABS_POSITION_SCALE);
        w.i16(quantize(p.yaw_degrees, YAW_SCALE));
    }

    let head_pose = head.unwrap_or_default();
    if flags.contains(PoseFlags::HEAD_VALID) {
        write_vec3(w, head_pose.position, ABS_POSITION_SCALE);
        w.u32(compress_quat(head_pose.rotation));
    }
    if flags.contains(PoseFlags::RIGHT_VALID) {
        encode_relative_pose(
            w,
            right.unwrap_or_default(),
            head_pose,
            encoding_flags.contains(EncodingFlags::RIGHT_HEAD_RELATIVE),
        );
    }
    if flags.contains(PoseFlags::LEFT_VALID) {
        encode_relative_pose(
            w,
            left.unwrap_or_default(),
            head_pose,
            encoding_flags.contains(EncodingFlags::LEFT_HEAD_RELATIVE),
        );
    }

    if flags.contains(PoseFlags::VIRTUALS_VALID) {
        let n = virtuals.len().min(MAX_VIRTUALS);
        w.u8(n as u8);
        for v in &virtuals[..n] {
            encode_relative_pose(w, *v, head_pose, encoding_flags.contains(EncodingFlags::VIRTUALS_HEAD_RELATIVE));
        }
    } else {
        w.u8(0);
    }
}

struct DecodedPoseFields {
    flags: PoseFlags,
    encoding_flags: EncodingFlags,
    physical: Option<PhysicalPose>,
    head: Option<Pose3>,
    right_hand: Option<Pose3>,
    left_hand: Option<Pose3>,
    virtuals: Vec<Pose3>,
}

fn decode_pose_fields(r: &mut ByteReader) -> Option<DecodedPoseFields> {
    let flags = PoseFlags::from_bits_truncate(r.u8()?).normalized();
    let encoding_flags = EncodingFlags::from_bits_truncate(r.u8()?);

    let physical = if flags.contains(PoseFlags::PHYSICAL_VALID) {
        let position = read_vec3(r, ABS_POSITION_SCALE)?;
        let yaw_degrees = dequantize(r.i16()?, YAW_SCALE);
        Some(PhysicalPose { position, yaw_degrees })
    } else {
        None
    };

    let head_pose = if flags.contains(PoseFlags::HEAD_VALID) {
        let position = read_vec3(r, ABS_POSITION_SCALE)?;
        let rotation = decompress_quat(r.u32()?);
        Some(Pose3 { position, rotation })
    } else {
        None
    };
    let head_for_relative = head_pose.unwrap_or_default();

    let right_hand = if flags.contains(PoseFlags::RIGHT_VALID) {
        decode_relative_pose(r, head_for_relative, encoding_flags.contains(EncodingFlags::RIGHT_HEAD_RELATIVE))
    } else {
        None
    };
    let left_hand = if flags.contains(PoseFlags::LEFT_VALID) {
        decode_relative_pose(r, head_for_relative, encoding_flags.contains(EncodingFlags::LEFT_HEAD_RELATIVE))
    } else {
        None
    };

    let v_count = r.u8()? as usize;
    let mut virtuals = Vec::with_capacity(v_count.min(MAX_VIRTUALS));
    for i in 0..v_count {
        let pose = decode_relative_pose(r, head_for_relative, encoding_flags.contains(EncodingFlags::VIRTUALS_HEAD_RELATIVE))?;
        if i < MAX_VIRTUALS {
            virtuals.push(pose);
        }
        // Excess entries beyond MAX_VIRTUALS are still read above to keep
        // the stream aligned, just not retained.
    }

    Some(DecodedPoseFields {
        flags,
        encoding_flags,
        physical,
        head: head_pose,
        right_hand,
        left_hand,
        virtuals,
    })
}

pub fn encode_client_pose(t: &ClientTransform) -> Result<Vec<u8>> {
    let mut w = ByteWriter::new();
    w.u8(MessageType::ClientPose as u8);
    w.u8(PROTOCOL_VERSION);
    w.short_str("device_id", &t.device_id)?;
    w.u16(t.pose_seq);
    encode_pose_fields(
        &mut w,
        t.flags,
        t.encoding_flags,
        t.physical,
        t.head,
        t.right_hand,
        t.left_hand,
        &t.virtuals,
    );
    Ok(w.finish())
}

pub fn decode_client_pose(data: &[u8]) -> Option<ClientTransform> {
    let mut r = ByteReader::new(data);
    if r.u8()? != MessageType::ClientPose as u8 {
        return None;
    }
    if r.u8()? != PROTOCOL_VERSION {
        return None;
    }
    let device_id = r.short_str()?;
    let pose_seq = r.u16()?;
    let fields = decode_pose_fields(&mut r)?;

    Some(ClientTransform {
        device_id,
        client_no: 0,
        pose_time: 0.0,
        pose_seq,
        flags: fields.flags,
        encoding_flags: fields.encoding_flags,
        physical: fields.physical,
        head: fields.head,
        right_hand: fields.right_hand,
        left_hand: fields.left_hand,
        virtuals: fields.virtuals,
    })
}

pub fn encode_room_pose(snap: &RoomTransformSnapshot) -> Result<Vec<u8>> {
    let mut w = ByteWriter::new();
    w.u8(MessageType::RoomPose as u8);
    w.u8(PROTOCOL_VERSION);
    w.short_str("room_id", &snap.room_id)?;
    w.f64(snap.broadcast_time);
    w.u16(snap.clients.len() as u16);
    for c in &snap.clients {
        w.u16(c.client_no);
        w.f64(c.pose_time);
        w.u16(c.pose_seq);
        encode_pose_fields(
            &mut w,
            c.flags,
            c.encoding_flags,
            c.physical,
            c.head,
            c.right_hand,
            c.left_hand,
            &c.virtuals,
        );
    }
    Ok(w.finish())
}

pub fn decode_room_pose(data: &[u8]) -> Option<RoomTransformSnapshot> {
    let mut r = ByteReader::new(data);
    if r.u8()? != MessageType::RoomPose as u8 {
        return None;
    }
    if r.u8()? != PROTOCOL_VERSION {
        return None;
    }
    let room_id = r.short_str()?;
    let broadcast_time = r.f64()?;
    let n = r.u16()?;
    let mut clients = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let client_no = r.u16()?;
        let pose_time = r.f64()?;
        let pose_seq = r.u16()?;
        let fields = decode_pose_fields(&mut r)?;
        clients.push(RoomClientEntry {
            client_no,
            pose_time,
            pose_seq,
            flags: fields.flags,
            encoding_flags: fields.encoding_flags,
            physical: fields.physical,
            head: fields.head,
            right_hand: fields.right_hand,
            left_hand: fields.left_hand,
            virtuals: fields.virtuals,
        });
    }
    Some(RoomTransformSnapshot { room_id, broadcast_time, clients })
}

/// 64-bit FNV-1a over the quantized pose bytes only (flags, encoding flags,
/// and valid parts) — excludes device id and pose sequence, so a sender can
/// detect "nothing changed on the wire" across ticks.
pub fn pose_signature(t: &ClientTransform) -> u64 {
    let mut w = ByteWriter::new();
    encode_pose_fields(
        &mut w,
        t.flags,
        t.encoding_flags,
        t.physical,
        t.head,
        t.right_hand,
        t.left_hand,
        &t.virtuals,
    );
    fnv1a_64(w.bytes())
}

/// Wrap-aware comparison for 16-bit sequence numbers: `a` is "less than" `b`
/// iff advancing from `a` to `b` is a smaller forward step than the reverse.
pub fn seq_less_than(a: u16, b: u16) -> bool {
    let diff = b.wrapping_sub(a);
    diff != 0 && diff < 0x8000
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn sample_transform() -> ClientTransform {
        ClientTransform {
            device_id: "device-a".to_string(),
            client_no: 0,
            pose_time: 0.0,
            pose_seq: 42,
            flags: PoseFlags::HEAD_VALID | PoseFlags::RIGHT_VALID | PoseFlags::VIRTUALS_VALID,
            encoding_flags: EncodingFlags::default(),
            physical: None,
            head: Some(Pose3 {
                position: Vec3::new(1.0, 1.6, 0.2),
                rotation: Quat::from_rotation_y(0.3),
            }),
            right_hand: Some(Pose3 {
                position: Vec3::new(1.3, 1.2, 0.3),
                rotation: Quat::IDENTITY,
            }),
            left_hand: None,
            virtuals: vec![Pose3 {
                position: Vec3::new(0.0, 0.0, 1.0),
                rotation: Quat::from_rotation_x(0.1),
            }],
        }
    }

    #[test]
    fn client_pose_round_trips_within_quantization_error() {
        let original = sample_transform();
        let encoded = encode_client_pose(&original).unwrap();
        let decoded = decode_client_pose(&encoded).unwrap();

        assert_eq!(decoded.device_id, original.device_id);
        assert_eq!(decoded.pose_seq, original.pose_seq);
        assert_eq!(decoded.flags.normalized(), original.flags.normalized());

        let h0 = original.head.unwrap();
        let h1 = decoded.head.unwrap();
        assert!((h0.position - h1.position).length() < 0.01);
        assert!(h0.rotation.angle_between(h1.rotation).to_degrees() < 0.2);

        let r0 = original.right_hand.unwrap();
        let r1 = decoded.right_hand.unwrap();
        assert!((r0.position - r1.position).length() < 0.01);
    }

    #[test]
    fn stealth_handshake_round_trips() {
        let stealth = ClientTransform::stealth("device-a");
        let encoded = encode_client_pose(&stealth).unwrap();
        let decoded = decode_client_pose(&encoded).unwrap();
        assert!(decoded.is_stealth());
        assert_eq!(decoded.pose_seq, 0);
        assert!(decoded.virtuals.is_empty());
    }

    #[test]
    fn head_invalid_forces_dependents_clear_on_encode() {
        let mut t = sample_transform();
        t.flags.remove(PoseFlags::HEAD_VALID);
        let encoded = encode_client_pose(&t).unwrap();
        let decoded = decode_client_pose(&encoded).unwrap();
        assert!(!decoded.flags.contains(PoseFlags::RIGHT_VALID));
        assert!(!decoded.flags.contains(PoseFlags::VIRTUALS_VALID));
    }

    #[test]
    fn pose_signature_ignores_device_id_and_seq() {
        let a = sample_transform();
        let mut b = a.clone();
        b.device_id = "device-b".to_string();
        b.pose_seq = a.pose_seq.wrapping_add(1);
        assert_eq!(pose_signature(&a), pose_signature(&b));

        let mut c = a.clone();
        c.head.as_mut().unwrap().position.x += 1.0;
        assert_ne!(pose_signature(&a), pose_signature(&c));
    }

    #[test]
    fn quaternion_compression_within_tolerance() {
        let mut max_angle = 0f32;
        let mut hasher_seed = 0x2545F4914F6CDD1Du64;
        for _ in 0..10_000 {
            hasher_seed = hasher_seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            let x = ((hasher_seed >> 16) as f32 / u32::MAX as f32) * 2.0 - 1.0;
            hasher_seed = hasher_seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            let y = ((hasher_seed >> 16) as f32 / u32::MAX as f32) * 2.0 - 1.0;
            hasher_seed = hasher_seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            let z = ((hasher_seed >> 16) as f32 / u32::MAX as f32) * 2.0 - 1.0;
            hasher_seed = hasher_seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            let w = ((hasher_seed >> 16) as f32 / u32::MAX as f32) * 2.0 - 1.0;

            let q = Quat::from_xyzw(x, y, z, w);
            if q.length_squared() < 1e-6 {
                continue;
            }
            let q = q.normalize();
            let packed = compress_quat(q);
            let decoded = decompress_quat(packed);
            let angle = q.angle_between(decoded).to_degrees();
            max_angle = max_angle.max(angle.min(180.0 - angle));
        }
        assert!(max_angle <= 0.2, "max angle error {max_angle}");
    }

    #[test]
    fn seq_wraparound_ordering() {
        assert!(seq_less_than(65535, 0));
        assert!(!seq_less_than(0, 65535));
        assert!(seq_less_than(10, 11));
        assert!(!seq_less_than(11, 10));
    }

    #[test]
    fn room_pose_round_trips_multiple_clients() {
        let snap = RoomTransformSnapshot {
            room_id: "R".to_string(),
            broadcast_time: 123.5,
            clients: vec![RoomClientEntry {
                client_no: 8,
                pose_time: 1.0,
                pose_seq: 5,
                flags: PoseFlags::HEAD_VALID,
                encoding_flags: EncodingFlags::default(),
                physical: None,
                head: Some(Pose3 { position: Vec3::new(1.0, 1.6, 0.0), rotation: Quat::IDENTITY }),
                right_hand: None,
                left_hand: None,
                virtuals: Vec::new(),
            }],
        };
        let encoded = encode_room_pose(&snap).unwrap();
        let decoded = decode_room_pose(&encoded).unwrap();
        assert_eq!(decoded.clients.len(), 1);
        assert_eq!(decoded.clients[0].client_no, 8);
    }

    #[test]
    fn truncated_frame_decodes_to_none() {
        assert!(decode_client_pose(&[MessageType::ClientPose as u8]).is_none());
    }
}
