use bitflags::bitflags;
use num_derive::{FromPrimitive, ToPrimitive};
use strum_macros::AsRefStr;

// max packet payload length (3-byte header length field).
pub const MAX_PAYLOAD_LEN: usize = 16_777_215;

pub const PACKET_HEADER_LEN: usize = 4;

/// auth-plugin-data-part-1: the first 8 bytes of the scramble.
pub const AUTH_PLUGIN_DATA_PART_1_LENGTH: usize = 8;
/// Full scramble length (part-1 + part-2).
pub const SCRAMBLE_SIZE: usize = 20;

/// Exchange charset fallback: utf8 for pre-5.5 servers, utf8mb4 otherwise.
pub const UTF8_GENERAL_CI: u8 = 33;
pub const UTF8MB4_UNICODE_CI: u8 = 224;

/// Batch markers of the JDBC surface.
pub const SUCCESS_NO_INFO: i64 = -2;
pub const EXECUTE_FAILED: i64 = -3;

#[derive(Debug, PartialEq, Eq, Clone, AsRefStr)]
pub enum AuthPluginName {
    #[strum(serialize = "mysql_old_password")]
    AuthMySqlOldPassword,
    #[strum(serialize = "caching_sha2_password")]
    AuthCachingSha2Password,
    #[strum(serialize = "sha256_password")]
    AuthSha256Password,
    #[strum(serialize = "mysql_native_password")]
    AuthNativePassword,
    #[strum(serialize = "mysql_clear_password")]
    AuthClearPassword,
    #[strum(serialize = "auth_unknown_plugin")]
    UnknownPluginName,
}

impl AuthPluginName {
    pub fn from_name(name: &str) -> AuthPluginName {
        match name {
            "mysql_old_password" => AuthPluginName::AuthMySqlOldPassword,
            "caching_sha2_password" => AuthPluginName::AuthCachingSha2Password,
            "sha256_password" => AuthPluginName::AuthSha256Password,
            "mysql_native_password" | "" => AuthPluginName::AuthNativePassword,
            "mysql_clear_password" => AuthPluginName::AuthClearPassword,
            _ => AuthPluginName::UnknownPluginName,
        }
    }
}

#[derive(Debug, PartialEq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum HeaderInfo {
    OkHeader = 0x00,
    ErrHeader = 0xff,
    EofHeader = 0xfe,
    LocalInFileHeader = 0xfb,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum CommandCode {
    ComSleep = 0,
    ComQuit,
    ComInitDB,
    ComQuery,
    ComFieldList,
    ComCreateDB,
    ComDropDB,
    ComRefresh,
    ComShutdown,
    ComStatistics,
    ComProcessInfo,
    ComConnect,
    ComProcessKill,
    ComDebug,
    ComPing,
    ComTime,
    ComDelayedInsert,
    ComChangeUser,
    ComBinlogDump,
    ComTableDump,
    ComConnectOut,
    ComRegisterSlave,
    ComStmtPrepare,
    ComStmtExecute,
    ComStmtSendLongData,
    ComStmtClose,
    ComStmtReset,
    ComSetOption,
    ComStmtFetch,
    ComDaemon,
    ComBinlogDumpGtid,
    ComResetConnection,
    ComEnd,
}

bitflags! {
    /// MariaDB capability extensions, negotiated through the high 32 bits
    /// of the handshake capability field.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MariaDbCapabilities: u64 {
        const MARIADB_CLIENT_PROGRESS = 1 << 32;
        const MARIADB_CLIENT_COM_MULTI = 1 << 33;
        const MARIADB_CLIENT_STMT_BULK_OPERATIONS = 1 << 34;
        const MARIADB_CLIENT_EXTENDED_TYPE_INFO = 1 << 35;
        const MARIADB_CLIENT_CACHE_METADATA = 1 << 36;
    }
}

/// Session-track entry types carried in OK packets when
/// SERVER_SESSION_STATE_CHANGED is set.
pub const SESSION_TRACK_SYSTEM_VARIABLES: u8 = 0;
pub const SESSION_TRACK_SCHEMA: u8 = 1;

/// Transaction isolation levels of the JDBC surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn test_command_codes() {
        assert_eq!(CommandCode::ComQuery as u8, 3);
        assert_eq!(CommandCode::ComStmtPrepare as u8, 22);
        assert_eq!(CommandCode::ComStmtExecute as u8, 23);
        assert_eq!(CommandCode::ComResetConnection as u8, 31);
    }

    #[test]
    pub fn test_auth_plugin_round_trip() {
        let plugin = AuthPluginName::from_name("caching_sha2_password");
        assert_eq!(plugin, AuthPluginName::AuthCachingSha2Password);
        assert_eq!(plugin.as_ref(), "caching_sha2_password");
        assert_eq!(
            AuthPluginName::from_name("").as_ref(),
            "mysql_native_password"
        );
    }

    #[test]
    pub fn test_bulk_capability_is_extended_bit() {
        assert!(MariaDbCapabilities::MARIADB_CLIENT_STMT_BULK_OPERATIONS.bits() > u32::MAX as u64);
    }
}
