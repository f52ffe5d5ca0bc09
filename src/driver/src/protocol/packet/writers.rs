use std::io::{self, Write};

use byteorder::{LittleEndian, WriteBytesExt};
use mysql_common::constants::CapabilityFlags;
use mysql_common::io::WriteMysqlExt;

use crate::params::ParameterHolder;
use crate::protocol::constants::CommandCode;
use crate::protocol::packet::PacketIo;

/// MariaDB bulk execute command (not part of the base command set).
pub const COM_STMT_BULK_EXECUTE: u8 = 0xfa;

/// Bulk flags.
pub const BULK_SEND_TYPES_TO_SERVER: u16 = 128;

/// Bulk row indicators.
pub const BULK_INDICATOR_NONE: u8 = 0;
pub const BULK_INDICATOR_NULL: u8 = 1;

/// SSLRequest: truncated handshake response sent before the TLS upgrade.
pub fn write_ssl_request(
    io: &mut PacketIo,
    capabilities: u64,
    max_packet: u32,
    collation: u8,
) -> io::Result<()> {
    io.write_u32::<LittleEndian>(capabilities as u32)?;
    io.write_u32::<LittleEndian>(max_packet)?;
    io.write_u8(collation)?;
    io.write_all(&[0u8; 19])?;
    io.write_u32::<LittleEndian>((capabilities >> 32) as u32)?;
    io.end_packet()?;
    io.flush_all()
}

#[allow(clippy::too_many_arguments)]
pub fn write_handshake_response(
    io: &mut PacketIo,
    capabilities: u64,
    max_packet: u32,
    collation: u8,
    user: &str,
    auth_response: &[u8],
    database: Option<&str>,
    auth_plugin: &str,
    connect_attrs: &[(String, String)],
) -> io::Result<()> {
    let caps = CapabilityFlags::from_bits_truncate(capabilities as u32);
    io.write_u32::<LittleEndian>(capabilities as u32)?;
    io.write_u32::<LittleEndian>(max_packet)?;
    io.write_u8(collation)?;
    io.write_all(&[0u8; 19])?;
    // MariaDB extended client capabilities live in the last filler bytes
    io.write_u32::<LittleEndian>((capabilities >> 32) as u32)?;

    io.write_all(user.as_bytes())?;
    io.write_u8(0)?;

    if caps.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA) {
        io.write_lenenc_str(auth_response)?;
    } else if caps.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
        io.write_u8(auth_response.len() as u8)?;
        io.write_all(auth_response)?;
    } else {
        io.write_all(auth_response)?;
        io.write_u8(0)?;
    }

    if caps.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) {
        io.write_all(database.unwrap_or("").as_bytes())?;
        io.write_u8(0)?;
    }
    if caps.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
        io.write_all(auth_plugin.as_bytes())?;
        io.write_u8(0)?;
    }
    if caps.contains(CapabilityFlags::CLIENT_CONNECT_ATTRS) {
        let mut attrs = Vec::new();
        for (key, value) in connect_attrs {
            attrs.write_lenenc_str(key.as_bytes())?;
            attrs.write_lenenc_str(value.as_bytes())?;
        }
        io.write_lenenc_str(&attrs)?;
    }
    io.end_packet()?;
    io.flush_all()
}

/// Continue the authentication exchange with a raw payload (scramble
/// answer, clear password, plugin switch response).
pub fn write_auth_response(io: &mut PacketIo, data: &[u8]) -> io::Result<()> {
    io.write_all(data)?;
    io.end_packet()?;
    io.flush_all()
}

pub fn write_query(io: &mut PacketIo, sql: &[u8]) -> io::Result<()> {
    io.start_command();
    io.write_u8(CommandCode::ComQuery as u8)?;
    io.write_all(sql)?;
    io.end_packet()?;
    io.flush_all()
}

fn write_bare_command(io: &mut PacketIo, code: CommandCode) -> io::Result<()> {
    io.start_command();
    io.write_u8(code as u8)?;
    io.end_packet()?;
    io.flush_all()
}

pub fn write_ping(io: &mut PacketIo) -> io::Result<()> {
    write_bare_command(io, CommandCode::ComPing)
}

pub fn write_quit(io: &mut PacketIo) -> io::Result<()> {
    write_bare_command(io, CommandCode::ComQuit)
}

pub fn write_reset_connection(io: &mut PacketIo) -> io::Result<()> {
    write_bare_command(io, CommandCode::ComResetConnection)
}

pub fn write_init_db(io: &mut PacketIo, database: &str) -> io::Result<()> {
    io.start_command();
    io.write_u8(CommandCode::ComInitDB as u8)?;
    io.write_all(database.as_bytes())?;
    io.end_packet()?;
    io.flush_all()
}

pub fn write_stmt_prepare(io: &mut PacketIo, sql: &[u8]) -> io::Result<()> {
    io.start_command();
    io.write_u8(CommandCode::ComStmtPrepare as u8)?;
    io.write_all(sql)?;
    io.end_packet()?;
    io.flush_all()
}

/// COM_STMT_CLOSE: fire and forget, no server response.
pub fn write_stmt_close(io: &mut PacketIo, statement_id: u32) -> io::Result<()> {
    io.start_command();
    io.write_u8(CommandCode::ComStmtClose as u8)?;
    io.write_u32::<LittleEndian>(statement_id)?;
    io.end_packet()?;
    io.flush_all()
}

/// COM_STMT_SEND_LONG_DATA: fire and forget, accumulates on the server.
pub fn write_stmt_send_long_data(
    io: &mut PacketIo,
    statement_id: u32,
    param_index: u16,
    chunk: &[u8],
) -> io::Result<()> {
    io.start_command();
    io.write_u8(CommandCode::ComStmtSendLongData as u8)?;
    io.write_u32::<LittleEndian>(statement_id)?;
    io.write_u16::<LittleEndian>(param_index)?;
    io.write_all(chunk)?;
    io.end_packet()?;
    io.flush_all()
}

pub fn write_stmt_execute(
    io: &mut PacketIo,
    statement_id: u32,
    parameters: &[ParameterHolder],
) -> io::Result<()> {
    io.start_command();
    io.write_u8(CommandCode::ComStmtExecute as u8)?;
    io.write_u32::<LittleEndian>(statement_id)?;
    io.write_u8(0)?; // CURSOR_TYPE_NO_CURSOR
    io.write_u32::<LittleEndian>(1)?; // iteration count

    if !parameters.is_empty() {
        let mut null_bitmap = vec![0u8; (parameters.len() + 7) / 8];
        for (i, param) in parameters.iter().enumerate() {
            if param.is_null() {
                null_bitmap[i / 8] |= 1 << (i % 8);
            }
        }
        io.write_all(&null_bitmap)?;
        io.write_u8(1)?; // new params bound

        for param in parameters {
            io.write_u8(param.column_type() as u8)?;
            io.write_u8(if param.is_unsigned() { 0x80 } else { 0 })?;
        }
        let mut values = Vec::new();
        for param in parameters {
            if !param.is_long_data() {
                param
                    .write_binary(&mut values)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            }
        }
        io.write_all(&values)?;
    }
    io.end_packet()?;
    io.flush_all()
}

/// MariaDB bulk execute: one COM_STMT_BULK_EXECUTE carrying an array of
/// parameter tuples.
pub fn write_stmt_bulk_execute(
    io: &mut PacketIo,
    statement_id: u32,
    types: &[(u8, bool)],
    parameters_list: &[Vec<ParameterHolder>],
) -> io::Result<()> {
    io.start_command();
    io.write_u8(COM_STMT_BULK_EXECUTE)?;
    io.write_u32::<LittleEndian>(statement_id)?;
    io.write_u16::<LittleEndian>(BULK_SEND_TYPES_TO_SERVER)?;

    for (type_tag, unsigned) in types {
        io.write_u8(*type_tag)?;
        io.write_u8(if *unsigned { 0x80 } else { 0 })?;
    }

    let mut values = Vec::new();
    for parameters in parameters_list {
        for param in parameters {
            if param.is_null() {
                values.push(BULK_INDICATOR_NULL);
            } else {
                values.push(BULK_INDICATOR_NONE);
                param
                    .write_binary(&mut values)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            }
        }
    }
    io.write_all(&values)?;
    io.end_packet()?;
    io.flush_all()
}

/// LOCAL INFILE content: data packets continuing the exchange, closed by an
/// empty packet.
pub fn write_local_infile_chunk(io: &mut PacketIo, chunk: &[u8]) -> io::Result<()> {
    io.write_all(chunk)?;
    io.end_packet()?;
    io.flush_all()
}

pub fn write_empty_packet(io: &mut PacketIo) -> io::Result<()> {
    io.end_packet()?;
    io.flush_all()
}
