//! Wire encode/decode for the non-pose frame kinds: RPC, device/client
//! mapping, and the two LWW variable namespaces. Pose frames live in
//! [`crate::codec`].

use crate::buffer::{ByteReader, ByteWriter};
use crate::codec::MessageType;
use crate::error::Result;
use crate::types::{DeviceMappingEntry, ServerVersion};

#[derive(Debug, Clone, PartialEq)]
pub struct RpcFrame {
    pub sender_client_no: u16,
    pub function_name: String,
    pub arguments_json: String,
}

pub fn encode_rpc(frame: &RpcFrame) -> Result<Vec<u8>> {
    let mut w = ByteWriter::new();
    w.u8(MessageType::Rpc as u8);
    w.u16(frame.sender_client_no);
    w.short_str("function_name", &frame.function_name)?;
    w.long_str("arguments_json", &frame.arguments_json)?;
    Ok(w.finish())
}

pub fn decode_rpc(data: &[u8]) -> Option<RpcFrame> {
    let mut r = ByteReader::new(data);
    if r.u8()? != MessageType::Rpc as u8 {
        return None;
    }
    Some(RpcFrame {
        sender_client_no: r.u16()?,
        function_name: r.short_str()?,
        arguments_json: r.long_str()?,
    })
}

/// Parses an `RpcFrame`'s `arguments_json` as a JSON array, once, at
/// delivery time. A malformed payload or a JSON value that isn't an array
/// yields an empty argument list rather than failing delivery.
pub fn parse_rpc_arguments(arguments_json: &str) -> Vec<serde_json::Value> {
    match serde_json::from_str::<serde_json::Value>(arguments_json) {
        Ok(serde_json::Value::Array(items)) => items,
        Ok(other) => {
            log::warn!("wire: rpc arguments is valid JSON but not an array: {other}");
            Vec::new()
        }
        Err(e) => {
            log::warn!("wire: rpc arguments failed to parse as JSON: {e}");
            Vec::new()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdMappingFrame {
    pub server_version: ServerVersion,
    pub entries: Vec<(DeviceMappingEntry, String)>,
}

pub fn encode_device_mapping(frame: &DeviceIdMappingFrame) -> Result<Vec<u8>> {
    let mut w = ByteWriter::new();
    w.u8(MessageType::DeviceIdMapping as u8);
    w.u8(frame.server_version.major);
    w.u8(frame.server_version.minor);
    w.u8(frame.server_version.patch);
    w.u16(frame.entries.len() as u16);
    for (entry, device_id) in &frame.entries {
        w.u16(entry.client_no);
        w.u8(entry.is_stealth as u8);
        w.short_str("device_id", device_id)?;
    }
    Ok(w.finish())
}

pub fn decode_device_mapping(data: &[u8]) -> Option<DeviceIdMappingFrame> {
    let mut r = ByteReader::new(data);
    if r.u8()? != MessageType::DeviceIdMapping as u8 {
        return None;
    }
    let server_version = ServerVersion {
        major: r.u8()?,
        minor: r.u8()?,
        patch: r.u8()?,
    };
    let n = r.u16()?;
    let mut entries = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let client_no = r.u16()?;
        let is_stealth = r.u8()? != 0;
        let device_id = r.short_str()?;
        entries.push((DeviceMappingEntry { client_no, is_stealth }, device_id));
    }
    Some(DeviceIdMappingFrame { server_version, entries })
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarEntry {
    pub name: String,
    pub value: String,
    pub timestamp: f64,
    pub last_writer: u16,
}

fn write_var_entry(w: &mut ByteWriter, e: &VarEntry, with_sender: Option<u16>, with_target: Option<u16>) -> Result<()> {
    if let Some(sender) = with_sender {
        w.u16(sender);
    }
    if let Some(target) = with_target {
        w.u16(target);
    }
    w.short_str("name", &e.name)?;
    w.long_str("value", &e.value)?;
    w.f64(e.timestamp);
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalVarSetFrame {
    pub sender: u16,
    pub entry: VarEntry,
}

pub fn encode_global_var_set(frame: &GlobalVarSetFrame) -> Result<Vec<u8>> {
    let mut w = ByteWriter::new();
    w.u8(MessageType::GlobalVarSet as u8);
    write_var_entry(&mut w, &frame.entry, Some(frame.sender), None)?;
    Ok(w.finish())
}

pub fn decode_global_var_set(data: &[u8]) -> Option<GlobalVarSetFrame> {
    let mut r = ByteReader::new(data);
    if r.u8()? != MessageType::GlobalVarSet as u8 {
        return None;
    }
    let sender = r.u16()?;
    let name = r.short_str()?;
    let value = r.long_str()?;
    let timestamp = r.f64()?;
    Some(GlobalVarSetFrame {
        sender,
        entry: VarEntry { name, value, timestamp, last_writer: sender },
    })
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GlobalVarSyncFrame {
    pub entries: Vec<VarEntry>,
}

pub fn encode_global_var_sync(frame: &GlobalVarSyncFrame) -> Result<Vec<u8>> {
    let mut w = ByteWriter::new();
    w.u8(MessageType::GlobalVarSync as u8);
    w.u16(frame.entries.len() as u16);
    for e in &frame.entries {
        w.short_str("name", &e.name)?;
        w.long_str("value", &e.value)?;
        w.f64(e.timestamp);
        w.u16(e.last_writer);
    }
    Ok(w.finish())
}

pub fn decode_global_var_sync(data: &[u8]) -> Option<GlobalVarSyncFrame> {
    let mut r = ByteReader::new(data);
    if r.u8()? != MessageType::GlobalVarSync as u8 {
        return None;
    }
    let n = r.u16()?;
    let mut entries = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let name = r.short_str()?;
        let value = r.long_str()?;
        let timestamp = r.f64()?;
        let last_writer = r.u16()?;
        entries.push(VarEntry { name, value, timestamp, last_writer });
    }
    Some(GlobalVarSyncFrame { entries })
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientVarSetFrame {
    pub sender: u16,
    pub target: u16,
    pub entry: VarEntry,
}

pub fn encode_client_var_set(frame: &ClientVarSetFrame) -> Result<Vec<u8>> {
    let mut w = ByteWriter::new();
    w.u8(MessageType::ClientVarSet as u8);
    w.u16(frame.sender);
    w.u16(frame.target);
    w.short_str("name", &frame.entry.name)?;
    w.long_str("value", &frame.entry.value)?;
    w.f64(frame.entry.timestamp);
    Ok(w.finish())
}

pub fn decode_client_var_set(data: &[u8]) -> Option<ClientVarSetFrame> {
    let mut r = ByteReader::new(data);
    if r.u8()? != MessageType::ClientVarSet as u8 {
        return None;
    }
    let sender = r.u16()?;
    let target = r.u16()?;
    let name = r.short_str()?;
    let value = r.long_str()?;
    let timestamp = r.f64()?;
    Some(ClientVarSetFrame {
        sender,
        target,
        entry: VarEntry { name, value, timestamp, last_writer: sender },
    })
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClientVarSyncFrame {
    pub per_client: Vec<(u16, Vec<VarEntry>)>,
}

pub fn encode_client_var_sync(frame: &ClientVarSyncFrame) -> Result<Vec<u8>> {
    let mut w = ByteWriter::new();
    w.u8(MessageType::ClientVarSync as u8);
    w.u16(frame.per_client.len() as u16);
    for (client_no, vars) in &frame.per_client {
        w.u16(*client_no);
        w.u16(vars.len() as u16);
        for e in vars {
            w.short_str("name", &e.name)?;
            w.long_str("value", &e.value)?;
            w.f64(e.timestamp);
            w.u16(e.last_writer);
        }
    }
    Ok(w.finish())
}

pub fn decode_client_var_sync(data: &[u8]) -> Option<ClientVarSyncFrame> {
    let mut r = ByteReader::new(data);
    if r.u8()? != MessageType::ClientVarSync as u8 {
        return None;
    }
    let n_clients = r.u16()?;
    let mut per_client = Vec::with_capacity(n_clients as usize);
    for _ in 0..n_clients {
        let client_no = r.u16()?;
        let n_vars = r.u16()?;
        let mut vars = Vec::with_capacity(n_vars as usize);
        for _ in 0..n_vars {
            let name = r.short_str()?;
            let value = r.long_str()?;
            let timestamp = r.f64()?;
            let last_writer = r.u16()?;
            vars.push(VarEntry { name, value, timestamp, last_writer });
        }
        per_client.push((client_no, vars));
    }
    Some(ClientVarSyncFrame { per_client })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_arguments_parse_array() {
        let args = parse_rpc_arguments(r#"["a", 1, true]"#);
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn rpc_arguments_non_array_yields_empty() {
        assert!(parse_rpc_arguments(r#"{"a": 1}"#).is_empty());
        assert!(parse_rpc_arguments("not json").is_empty());
    }

    #[test]
    fn rpc_round_trips() {
        let frame = RpcFrame {
            sender_client_no: 7,
            function_name: "ping".to_string(),
            arguments_json: "[]".to_string(),
        };
        let encoded = encode_rpc(&frame).unwrap();
        assert_eq!(decode_rpc(&encoded), Some(frame));
    }

    #[test]
    fn device_mapping_round_trips() {
        let frame = DeviceIdMappingFrame {
            server_version: ServerVersion { major: 1, minor: 2, patch: 3 },
            entries: vec![(DeviceMappingEntry { client_no: 8, is_stealth: false }, "device-b".to_string())],
        };
        let encoded = encode_device_mapping(&frame).unwrap();
        assert_eq!(decode_device_mapping(&encoded), Some(frame));
    }

    #[test]
    fn global_var_sync_round_trips() {
        let frame = GlobalVarSyncFrame {
            entries: vec![VarEntry { name: "score".into(), value: "10".into(), timestamp: 1.0, last_writer: 3 }],
        };
        let encoded = encode_global_var_sync(&frame).unwrap();
        assert_eq!(decode_global_var_sync(&encoded), Some(frame));
    }

    #[test]
    fn client_var_sync_round_trips() {
        let frame = ClientVarSyncFrame {
            per_client: vec![(8, vec![VarEntry { name: "ready".into(), value: "true".into(), timestamp: 2.0, last_writer: 8 }])],
        };
        let encoded = encode_client_var_sync(&frame).unwrap();
        assert_eq!(decode_client_var_sync(&encoded), Some(frame));
    }
}
