use crate::error::{Result, SqlError};

/// Server facts the rewriter needs: CONVERT(…, DOUBLE) only exists on
/// MariaDB and MySQL ≥ 8.0.17, and backslash handling follows the session
/// sql_mode.
#[derive(Debug, Clone, Copy)]
pub struct EscapeContext {
    pub server_mariadb: bool,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub no_backslash_escapes: bool,
}

impl EscapeContext {
    pub fn version_greater_or_equal(&self, major: u32, minor: u32, patch: u32) -> bool {
        (self.major, self.minor, self.patch) >= (major, minor, patch)
    }
}

/// Replace the type argument of `CONVERT(value, SQL_T)` and the
/// `SQL_TSI_` interval prefix of `TIMESTAMPDIFF` / `TIMESTAMPADD`.
fn replace_function_parameter(function_string: &str, ctx: &EscapeContext) -> String {
    let input = function_string.as_bytes();
    let mut index = 0;
    while index < input.len() && input[index] == b' ' {
        index += 1;
    }
    let name_start = index;
    while index < input.len() && input[index].is_ascii_alphabetic() {
        index += 1;
    }
    let func = function_string[name_start..index].to_lowercase();

    if func == "convert" {
        let last_comma = match function_string.rfind(',') {
            Some(pos) => pos,
            None => return function_string.to_string(),
        };
        let first_paren = match function_string.find('(') {
            Some(pos) => pos,
            None => return function_string.to_string(),
        };
        let value = &function_string[first_paren + 1..last_comma];

        let mut index = last_comma + 1;
        while index < input.len() && input[index].is_ascii_whitespace() {
            index += 1;
        }
        let mut end_param = index;
        while end_param < input.len()
            && (input[end_param].is_ascii_alphabetic() || input[end_param] == b'_')
        {
            end_param += 1;
        }
        let mut type_param = function_string[index..end_param].to_uppercase();
        if let Some(stripped) = type_param.strip_prefix("SQL_") {
            type_param = stripped.to_string();
        }

        match type_param.as_str() {
            "BOOLEAN" => return format!("1={value}"),
            "BIGINT" | "SMALLINT" | "TINYINT" => type_param = "SIGNED INTEGER".to_string(),
            "BIT" => type_param = "UNSIGNED INTEGER".to_string(),
            "BLOB" | "VARBINARY" | "LONGVARBINARY" | "ROWID" => {
                type_param = "BINARY".to_string()
            }
            "NCHAR" | "CLOB" | "NCLOB" | "DATALINK" | "VARCHAR" | "NVARCHAR"
            | "LONGVARCHAR" | "LONGNVARCHAR" | "SQLXML" | "LONGNCHAR" => {
                type_param = "CHAR".to_string()
            }
            "DOUBLE" | "FLOAT" => {
                if ctx.server_mariadb || ctx.version_greater_or_equal(8, 0, 17) {
                    type_param = "DOUBLE".to_string();
                } else {
                    return format!("0.0+{value}");
                }
            }
            "REAL" | "NUMERIC" => type_param = "DECIMAL".to_string(),
            "TIMESTAMP" => type_param = "DATETIME".to_string(),
            _ => {}
        }
        return format!(
            "{}{}{}",
            &function_string[..index],
            type_param,
            &function_string[end_param..]
        );
    }

    if func == "timestampdiff" || func == "timestampadd" {
        let mut index = index;
        while index < input.len() && (input[index].is_ascii_whitespace() || input[index] == b'(')
        {
            index += 1;
        }
        if index + 8 <= input.len() && function_string[index..].starts_with("SQL_TSI_") {
            return format!(
                "{}{}",
                &function_string[..index],
                &function_string[index + 8..]
            );
        }
        return function_string.to_string();
    }
    function_string.to_string()
}

/// Resolve one `{…}` escape (braces included).
fn resolve_escapes(escaped: &str, ctx: &EscapeContext) -> Result<String> {
    if !escaped.starts_with('{') || !escaped.ends_with('}') {
        return Err(SqlError::parse("unexpected escaped string", 0));
    }
    let end_index = escaped.len() - 1;
    let escaped_lower = escaped.to_lowercase();

    if escaped.starts_with("{fn ") {
        let resolved = replace_function_parameter(&escaped[4..end_index], ctx);
        return native_sql(&resolved, ctx);
    } else if escaped_lower.starts_with("{oj ") {
        return native_sql(&escaped[4..end_index], ctx);
    } else if escaped.starts_with("{d ") {
        return Ok(escaped[3..end_index].to_string());
    } else if escaped.starts_with("{t ") {
        return Ok(escaped[3..end_index].to_string());
    } else if escaped.starts_with("{ts ") {
        return Ok(escaped[4..end_index].to_string());
    } else if escaped.starts_with("{d'") {
        return Ok(escaped[2..end_index].to_string());
    } else if escaped.starts_with("{t'") {
        return Ok(escaped[2..end_index].to_string());
    } else if escaped.starts_with("{ts'") {
        return Ok(escaped[3..end_index].to_string());
    } else if escaped.starts_with("{call ") || escaped.starts_with("{CALL ") {
        return native_sql(&escaped[1..end_index], ctx);
    } else if escaped.starts_with("{escape ") {
        return Ok(escaped[1..end_index].to_string());
    } else if escaped.starts_with("{?") {
        return native_sql(&escaped[1..end_index], ctx);
    } else if escaped.starts_with("{ ") || escaped.starts_with("{\n") || escaped.starts_with("{\r\n")
    {
        for (offset, c) in escaped.char_indices().skip(1) {
            if !c.is_whitespace() {
                let mut tmp = String::from("{");
                tmp.push_str(&escaped[offset..]);
                return resolve_escapes(&tmp, ctx);
            }
        }
    }
    // unknown escape forms pass through untouched
    Ok(escaped.to_string())
}

/// Translate the JDBC `{…}` escapes of a SQL string to vendor SQL. The
/// lexer mirrors the placeholder splitter: escapes inside strings,
/// identifiers and comments are left alone.
pub fn native_sql(sql: &str, ctx: &EscapeContext) -> Result<String> {
    if !sql.contains('{') {
        return Ok(sql.to_string());
    }

    let mut escape_sequence_buf = String::new();
    let mut sql_buffer = String::with_capacity(sql.len());

    let mut last_char = '\0';
    let mut in_quote = false;
    let mut quote_char = '\0';
    let mut in_comment = false;
    let mut is_slash_slash_comment = false;
    let mut in_escape_seq = 0usize;

    for car in sql.chars() {
        if last_char == '\\' && !ctx.no_backslash_escapes && in_quote {
            if in_escape_seq > 0 {
                escape_sequence_buf.push(car);
            } else {
                sql_buffer.push(car);
            }
            last_char = '\0';
            continue;
        }

        match car {
            '\'' | '"' | '`' => {
                if !in_comment {
                    if in_quote {
                        if quote_char == car {
                            in_quote = false;
                        }
                    } else {
                        in_quote = true;
                        quote_char = car;
                    }
                }
            }
            '*' => {
                if !in_quote && !in_comment && last_char == '/' {
                    in_comment = true;
                    is_slash_slash_comment = false;
                }
            }
            '/' | '-' => {
                if !in_quote {
                    if in_comment {
                        if last_char == '*' && !is_slash_slash_comment {
                            in_comment = false;
                        } else if last_char == car && is_slash_slash_comment {
                            in_comment = false;
                        }
                    } else if last_char == car {
                        in_comment = true;
                        is_slash_slash_comment = true;
                    } else if last_char == '*' {
                        in_comment = true;
                        is_slash_slash_comment = false;
                    }
                }
            }
            '\n' => {
                if in_comment && is_slash_slash_comment {
                    in_comment = false;
                }
            }
            '{' => {
                if !in_quote && !in_comment {
                    in_escape_seq += 1;
                }
            }
            '}' => {
                if !in_quote && !in_comment && in_escape_seq > 0 {
                    in_escape_seq -= 1;
                    if in_escape_seq == 0 {
                        escape_sequence_buf.push(car);
                        sql_buffer.push_str(&resolve_escapes(&escape_sequence_buf, ctx)?);
                        escape_sequence_buf.clear();
                        last_char = car;
                        continue;
                    }
                }
            }
            _ => {}
        }
        last_char = car;
        if in_escape_seq > 0 {
            escape_sequence_buf.push(car);
        } else {
            sql_buffer.push(car);
        }
    }
    if in_escape_seq > 0 {
        return Err(SqlError::parse(
            format!(
                "Invalid escape sequence, missing closing '}}' character in '{sql_buffer}'"
            ),
            sql.len(),
        ));
    }
    Ok(sql_buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> EscapeContext {
        EscapeContext {
            server_mariadb: true,
            major: 10,
            minor: 6,
            patch: 0,
            no_backslash_escapes: false,
        }
    }

    fn mysql57() -> EscapeContext {
        EscapeContext {
            server_mariadb: false,
            major: 5,
            minor: 7,
            patch: 30,
            no_backslash_escapes: false,
        }
    }

    #[test]
    pub fn test_fn_convert_types() {
        assert_eq!(
            native_sql("{fn CONVERT(x, SQL_BIGINT)}", &ctx()).unwrap(),
            "CONVERT(x, SIGNED INTEGER)"
        );
        assert_eq!(
            native_sql("{fn CONVERT(c, SQL_VARCHAR)}", &ctx()).unwrap(),
            "CONVERT(c, CHAR)"
        );
        assert_eq!(
            native_sql("{fn CONVERT(b, SQL_BIT)}", &ctx()).unwrap(),
            "CONVERT(b, UNSIGNED INTEGER)"
        );
        assert_eq!(
            native_sql("{fn CONVERT(b, SQL_BOOLEAN)}", &ctx()).unwrap(),
            "1=b"
        );
        assert_eq!(
            native_sql("{fn CONVERT(t, SQL_TIMESTAMP)}", &ctx()).unwrap(),
            "CONVERT(t, DATETIME)"
        );
    }

    #[test]
    pub fn test_fn_convert_double_depends_on_server() {
        assert_eq!(
            native_sql("{fn CONVERT(x, SQL_DOUBLE)}", &ctx()).unwrap(),
            "CONVERT(x, DOUBLE)"
        );
        assert_eq!(
            native_sql("{fn CONVERT(x, SQL_DOUBLE)}", &mysql57()).unwrap(),
            "0.0+x"
        );
    }

    #[test]
    pub fn test_timestamp_functions_strip_tsi_prefix() {
        assert_eq!(
            native_sql("{fn TIMESTAMPDIFF(SQL_TSI_HOUR, a, b)}", &ctx()).unwrap(),
            "TIMESTAMPDIFF(HOUR, a, b)"
        );
        assert_eq!(
            native_sql("{fn TIMESTAMPADD(SQL_TSI_SECOND, 1, b)}", &ctx()).unwrap(),
            "TIMESTAMPADD(SECOND, 1, b)"
        );
    }

    #[test]
    pub fn test_temporal_literals() {
        assert_eq!(
            native_sql("SELECT {d '2023-01-31'}", &ctx()).unwrap(),
            "SELECT '2023-01-31'"
        );
        assert_eq!(
            native_sql("SELECT {t '12:13:14'}", &ctx()).unwrap(),
            "SELECT '12:13:14'"
        );
        assert_eq!(
            native_sql("SELECT {ts '2023-01-31 12:13:14'}", &ctx()).unwrap(),
            "SELECT '2023-01-31 12:13:14'"
        );
    }

    #[test]
    pub fn test_call_and_oj() {
        assert_eq!(
            native_sql("{call proc(?, ?)}", &ctx()).unwrap(),
            "call proc(?, ?)"
        );
        assert_eq!(
            native_sql("{? = call proc(?)}", &ctx()).unwrap(),
            "? = call proc(?)"
        );
        assert_eq!(
            native_sql(
                "SELECT * FROM {oj a LEFT OUTER JOIN b ON a.id = b.id}",
                &ctx()
            )
            .unwrap(),
            "SELECT * FROM a LEFT OUTER JOIN b ON a.id = b.id"
        );
    }

    #[test]
    pub fn test_escapes_inside_literals_untouched() {
        let sql = "SELECT '{fn now()}', `a{b}`, -- {d '2020-01-01'}\n 1";
        assert_eq!(native_sql(sql, &ctx()).unwrap(), sql);
    }

    #[test]
    pub fn test_idempotent_on_plain_sql() {
        let sql = "SELECT 1 FROM t WHERE a = 'x'";
        let once = native_sql(sql, &ctx()).unwrap();
        let twice = native_sql(&once, &ctx()).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once, sql);
    }

    #[test]
    pub fn test_nested_escape() {
        assert_eq!(
            native_sql("{fn CONVERT({fn CONVERT(x, SQL_BIGINT)}, SQL_VARCHAR)}", &ctx())
                .unwrap(),
            "CONVERT(CONVERT(x, SIGNED INTEGER), CHAR)"
        );
    }

    #[test]
    pub fn test_mismatched_brace_is_parse_error() {
        let err = native_sql("SELECT {fn now(", &ctx()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Parse);
        assert!(err.parse_position().is_some());
    }

    #[test]
    pub fn test_unknown_escape_passthrough() {
        assert_eq!(native_sql("{limit 5}", &ctx()).unwrap(), "{limit 5}");
    }
}
