use std::io;

use mysql_common::constants::{CapabilityFlags, StatusFlags};

use crate::error::SqlError;
use crate::protocol::constants::AUTH_PLUGIN_DATA_PART_1_LENGTH;
use crate::protocol::packet::PacketBuf;

/// Server greeting (protocol version 10).
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub seed: Vec<u8>,
    pub capabilities: u64,
    pub default_collation: u8,
    pub status_flags: StatusFlags,
    pub auth_plugin: String,
}

pub fn parse_initial_handshake(payload: &[u8]) -> io::Result<InitialHandshake> {
    let mut buf = PacketBuf::new(payload);
    let protocol_version = buf.read_u8()?;
    if protocol_version != 10 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected initial handshake protocol value [{protocol_version}]"),
        ));
    }
    let server_version = String::from_utf8_lossy(buf.read_str_null()?).into_owned();
    let connection_id = buf.read_u32_le()?;
    let mut seed = buf.read_bytes(AUTH_PLUGIN_DATA_PART_1_LENGTH)?.to_vec();
    buf.skip(1)?; // filler
    let caps_low = buf.read_u16_le()? as u64;
    let default_collation = buf.read_u8()?;
    let status_flags = StatusFlags::from_bits_truncate(buf.read_u16_le()?);
    let caps_high = buf.read_u16_le()? as u64;
    let auth_data_len = buf.read_u8()? as usize;
    buf.skip(6)?; // filler
    // MariaDB stores extended capabilities in the last 4 filler bytes
    let caps_mariadb = buf.read_u32_le()? as u64;
    let capabilities = caps_low | (caps_high << 16) | (caps_mariadb << 32);

    if capabilities & CapabilityFlags::CLIENT_SECURE_CONNECTION.bits() as u64 != 0 {
        // seed part 2: max(13, auth_data_len - 8), null terminated
        let part2_len = std::cmp::max(13, auth_data_len.saturating_sub(8));
        let part2 = buf.read_bytes(part2_len.min(buf.remaining()))?;
        let part2 = match part2.last() {
            Some(0) => &part2[..part2.len() - 1],
            _ => part2,
        };
        seed.extend_from_slice(part2);
    }

    let auth_plugin = if capabilities & CapabilityFlags::CLIENT_PLUGIN_AUTH.bits() as u64 != 0
        && !buf.is_empty()
    {
        // some servers omit the trailing null
        let rest = buf.read_rest();
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        String::from_utf8_lossy(&rest[..end]).into_owned()
    } else {
        String::new()
    };

    Ok(InitialHandshake {
        protocol_version,
        server_version,
        connection_id,
        seed,
        capabilities,
        default_collation,
        status_flags,
        auth_plugin,
    })
}

/// Session-track entry in an OK packet: type byte plus raw payload.
#[derive(Debug, Clone)]
pub struct SessionStateChange {
    pub change_type: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: StatusFlags,
    pub warnings: u16,
    pub info: String,
    pub state_changes: Vec<SessionStateChange>,
}

pub fn parse_ok_packet(payload: &[u8], capabilities: CapabilityFlags) -> io::Result<OkPacket> {
    let mut buf = PacketBuf::new(payload);
    let _header = buf.read_u8()?;
    let affected_rows = buf.read_lenenc_int()?.unwrap_or(0);
    let last_insert_id = buf.read_lenenc_int()?.unwrap_or(0);
    let status_flags = StatusFlags::from_bits_retain(buf.read_u16_le()?);
    let warnings = buf.read_u16_le()?;

    let mut info = String::new();
    let mut state_changes = Vec::new();
    if !buf.is_empty() {
        if capabilities.contains(CapabilityFlags::CLIENT_SESSION_TRACK) {
            info = buf.read_lenenc_string()?;
            if status_flags.contains(StatusFlags::SERVER_SESSION_STATE_CHANGED)
                && !buf.is_empty()
            {
                let all = buf.read_lenenc_bytes()?.unwrap_or(&[]);
                let mut entries = PacketBuf::new(all);
                while !entries.is_empty() {
                    let change_type = entries.read_u8()?;
                    let data = entries.read_lenenc_bytes()?.unwrap_or(&[]).to_vec();
                    state_changes.push(SessionStateChange { change_type, data });
                }
            }
        } else {
            info = String::from_utf8_lossy(buf.read_rest()).into_owned();
        }
    }

    Ok(OkPacket {
        affected_rows,
        last_insert_id,
        status_flags,
        warnings,
        info,
        state_changes,
    })
}

/// ERR packet → SqlError with vendor code, SQLState and message.
pub fn parse_err_packet(payload: &[u8]) -> SqlError {
    let mut buf = PacketBuf::new(payload);
    let parsed: io::Result<(u16, String, String)> = (|| {
        let _header = buf.read_u8()?;
        let code = buf.read_u16_le()?;
        let (state, message) = match buf.peek_u8() {
            Some(b'#') => {
                buf.skip(1)?;
                let state = String::from_utf8_lossy(buf.read_bytes(5)?).into_owned();
                let msg = String::from_utf8_lossy(buf.read_rest()).into_owned();
                (state, msg)
            }
            _ => (
                "HY000".to_string(),
                String::from_utf8_lossy(buf.read_rest()).into_owned(),
            ),
        };
        Ok((code, state, message))
    })();
    match parsed {
        Ok((code, state, message)) => SqlError::from_server(code, &state, message),
        Err(_) => SqlError::connection("malformed ERR packet"),
    }
}

/// EOF packet (pre-DEPRECATE_EOF servers): warnings and server status.
pub fn parse_eof_packet(payload: &[u8]) -> io::Result<(u16, StatusFlags)> {
    let mut buf = PacketBuf::new(payload);
    let _header = buf.read_u8()?;
    let warnings = buf.read_u16_le()?;
    let status = StatusFlags::from_bits_truncate(buf.read_u16_le()?);
    Ok((warnings, status))
}

/// OK-with-EOF-header trailing packet sent when DEPRECATE_EOF is on.
pub fn parse_eof_deprecated_ok(
    payload: &[u8],
    capabilities: CapabilityFlags,
) -> io::Result<OkPacket> {
    parse_ok_packet(payload, capabilities)
}

#[derive(Debug, Clone)]
pub struct AuthSwitchRequest {
    pub plugin_name: String,
    pub seed: Vec<u8>,
}

pub fn parse_auth_switch_request(payload: &[u8]) -> io::Result<AuthSwitchRequest> {
    let mut buf = PacketBuf::new(payload);
    let _header = buf.read_u8()?; // 0xfe
    let plugin_name = String::from_utf8_lossy(buf.read_str_null()?).into_owned();
    let mut seed = buf.read_rest().to_vec();
    if seed.last() == Some(&0) {
        seed.pop();
    }
    Ok(AuthSwitchRequest { plugin_name, seed })
}

#[derive(Debug, Clone, Copy)]
pub struct StmtPrepareOk {
    pub statement_id: u32,
    pub num_columns: u16,
    pub num_params: u16,
    pub warnings: u16,
}

pub fn parse_stmt_prepare_ok(payload: &[u8]) -> io::Result<StmtPrepareOk> {
    let mut buf = PacketBuf::new(payload);
    let _status = buf.read_u8()?; // 0x00
    let statement_id = buf.read_u32_le()?;
    let num_columns = buf.read_u16_le()?;
    let num_params = buf.read_u16_le()?;
    let _filler = buf.read_u8()?;
    let warnings = if buf.remaining() >= 2 {
        buf.read_u16_le()?
    } else {
        0
    };
    Ok(StmtPrepareOk {
        statement_id,
        num_columns,
        num_params,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::{SESSION_TRACK_SCHEMA, SESSION_TRACK_SYSTEM_VARIABLES};

    #[test]
    pub fn test_parse_ok_packet_plain() {
        let payload = [0x00, 0x01, 0x00, 0x03, 0x00, 0x00, 0x00];
        let ok = parse_ok_packet(&payload, CapabilityFlags::empty()).unwrap();
        assert_eq!(ok.affected_rows, 1);
        assert_eq!(ok.last_insert_id, 0);
        assert!(ok
            .status_flags
            .contains(StatusFlags::SERVER_STATUS_AUTOCOMMIT));
        assert!(ok.status_flags.contains(StatusFlags::SERVER_STATUS_IN_TRANS));
    }

    #[test]
    pub fn test_parse_ok_packet_session_track() {
        // OK + SERVER_SESSION_STATE_CHANGED with a schema change to "test"
        let mut payload = vec![0x00, 0x00, 0x00];
        payload.extend_from_slice(&0x4002u16.to_le_bytes()); // autocommit | state changed
        payload.extend_from_slice(&[0x00, 0x00]); // warnings
        payload.push(0); // info (lenenc, empty)
        let schema_entry = [SESSION_TRACK_SCHEMA, 5, 4, b't', b'e', b's', b't'];
        payload.push(schema_entry.len() as u8);
        payload.extend_from_slice(&schema_entry);

        let ok = parse_ok_packet(&payload, CapabilityFlags::CLIENT_SESSION_TRACK).unwrap();
        assert!(ok
            .status_flags
            .contains(StatusFlags::SERVER_SESSION_STATE_CHANGED));
        assert_eq!(ok.state_changes.len(), 1);
        assert_eq!(ok.state_changes[0].change_type, SESSION_TRACK_SCHEMA);
        assert_eq!(&ok.state_changes[0].data, &[4, b't', b'e', b's', b't']);
    }

    #[test]
    pub fn test_parse_err_packet() {
        let mut payload = vec![0xff];
        payload.extend_from_slice(&1064u16.to_le_bytes());
        payload.push(b'#');
        payload.extend_from_slice(b"42000");
        payload.extend_from_slice(b"You have an error in your SQL syntax");
        let err = parse_err_packet(&payload);
        assert_eq!(err.error_code(), 1064);
        assert_eq!(err.sql_state(), "42000");
        assert!(err.message().contains("SQL syntax"));
    }

    #[test]
    pub fn test_parse_initial_handshake() {
        let mut payload = vec![10];
        payload.extend_from_slice(b"5.5.5-10.6.12-MariaDB\0");
        payload.extend_from_slice(&42u32.to_le_bytes()); // connection id
        payload.extend_from_slice(b"abcdefgh"); // seed part 1
        payload.push(0);
        let caps_low = (CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION)
            .bits() as u16;
        payload.extend_from_slice(&caps_low.to_le_bytes());
        payload.push(45); // collation
        payload.extend_from_slice(&2u16.to_le_bytes()); // status: autocommit
        let caps_high =
            ((CapabilityFlags::CLIENT_PLUGIN_AUTH.bits() as u64) >> 16) as u16;
        payload.extend_from_slice(&caps_high.to_le_bytes());
        payload.push(21); // auth data len
        payload.extend_from_slice(&[0; 6]);
        payload.extend_from_slice(&4u32.to_le_bytes()); // mariadb extended caps
        payload.extend_from_slice(b"ijklmnopqrst\0"); // seed part 2
        payload.extend_from_slice(b"mysql_native_password\0");

        let handshake = parse_initial_handshake(&payload).unwrap();
        assert_eq!(handshake.server_version, "5.5.5-10.6.12-MariaDB");
        assert_eq!(handshake.connection_id, 42);
        assert_eq!(handshake.seed, b"abcdefghijklmnopqrst");
        assert_eq!(handshake.auth_plugin, "mysql_native_password");
        assert_eq!(handshake.capabilities >> 32, 4);
        assert_eq!(handshake.default_collation, 45);
    }

    #[test]
    pub fn test_parse_stmt_prepare_ok() {
        let mut payload = vec![0x00];
        payload.extend_from_slice(&7u32.to_le_bytes());
        payload.extend_from_slice(&2u16.to_le_bytes());
        payload.extend_from_slice(&1u16.to_le_bytes());
        payload.push(0);
        payload.extend_from_slice(&0u16.to_le_bytes());
        let ok = parse_stmt_prepare_ok(&payload).unwrap();
        assert_eq!(ok.statement_id, 7);
        assert_eq!(ok.num_columns, 2);
        assert_eq!(ok.num_params, 1);
    }

    #[test]
    pub fn test_parse_auth_switch() {
        let mut payload = vec![0xfe];
        payload.extend_from_slice(b"caching_sha2_password\0");
        payload.extend_from_slice(b"seedseedseedseedseed\0");
        let req = parse_auth_switch_request(&payload).unwrap();
        assert_eq!(req.plugin_name, "caching_sha2_password");
        assert_eq!(req.seed, b"seedseedseedseedseed");
    }

    #[test]
    pub fn test_session_track_sysvar_entry_layout() {
        // system-variable entry: name + value, both lenenc
        let entry = [
            SESSION_TRACK_SYSTEM_VARIABLES,
            7,
            2,
            b'a',
            b'i',
            3,
            b'1',
            b'0',
            b'0',
        ];
        let mut buf = PacketBuf::new(&entry[1..]);
        let data = buf.read_lenenc_bytes().unwrap().unwrap();
        let mut inner = PacketBuf::new(data);
        assert_eq!(inner.read_lenenc_bytes().unwrap().unwrap(), b"ai");
        assert_eq!(inner.read_lenenc_bytes().unwrap().unwrap(), b"100");
    }
}
