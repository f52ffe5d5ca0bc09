use crate::error::{Result, SqlError};
use crate::params::ParameterHolder;

/// Client-side prepared statement: the SQL template split at `?`
/// placeholders sitting outside strings, identifiers and comments.
///
/// Two part layouts exist:
/// - plain: `param_count + 1` constant parts, placeholders in between;
/// - rewrite: `param_count + 3` parts for INSERT statements eligible for
///   multi-values batching: `parts[1]` is the statement head up to the
///   value group, `parts[0]` the group opening up to the first placeholder,
///   `parts[2..=param_count]` the in-group separators, `parts[param_count+1]`
///   the group closing, `parts[param_count+2]` the trailing suffix.
#[derive(Debug, Clone)]
pub struct ClientPrepareResult {
    sql: String,
    query_parts: Vec<Vec<u8>>,
    param_count: usize,
    rewrite_layout: bool,
    multi_values_rewritable: bool,
    multiple_queries_rewritable: bool,
}

#[derive(Debug, Default)]
struct LexerScan {
    /// byte offsets of placeholders
    params: Vec<usize>,
    /// `;` seen outside quotes and comments
    has_semicolon: bool,
    /// scan ended outside any string or block comment
    terminated_cleanly: bool,
    /// identifier-ish words at top lexical level: (uppercased, offset, paren depth)
    words: Vec<(String, usize, i32)>,
    /// open/close offsets of parenthesis groups at depth 0→1
    groups: Vec<(usize, usize)>,
}

fn scan(sql: &str, no_backslash_escapes: bool) -> LexerScan {
    let bytes = sql.as_bytes();
    let mut state = LexerScan::default();
    let mut in_quote: Option<u8> = None;
    let mut in_block_comment = false;
    let mut in_line_comment = false;
    let mut depth: i32 = 0;
    let mut word_start: Option<usize> = None;
    let mut open_stack: Vec<usize> = Vec::new();

    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];

        if in_line_comment {
            if c == b'\n' {
                in_line_comment = false;
            }
            i += 1;
            continue;
        }
        if in_block_comment {
            if c == b'*' && bytes.get(i + 1) == Some(&b'/') {
                in_block_comment = false;
                i += 2;
                continue;
            }
            i += 1;
            continue;
        }
        if let Some(quote) = in_quote {
            if c == b'\\' && !no_backslash_escapes && quote != b'`' {
                i += 2;
                continue;
            }
            if c == quote {
                if bytes.get(i + 1) == Some(&quote) {
                    // doubled quote stays inside the literal
                    i += 2;
                    continue;
                }
                in_quote = None;
            }
            i += 1;
            continue;
        }

        let is_word_byte = c.is_ascii_alphanumeric() || c == b'_' || c == b'$';
        if is_word_byte {
            if word_start.is_none() {
                word_start = Some(i);
            }
            i += 1;
            continue;
        }
        if let Some(start) = word_start.take() {
            state
                .words
                .push((sql[start..i].to_ascii_uppercase(), start, depth));
        }

        match c {
            b'\'' | b'"' | b'`' => in_quote = Some(c),
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                in_block_comment = true;
                i += 2;
                continue;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                in_line_comment = true;
                i += 2;
                continue;
            }
            b'#' => in_line_comment = true,
            b'?' => state.params.push(i),
            b';' => state.has_semicolon = true,
            b'(' => {
                if depth == 0 {
                    open_stack.push(i);
                }
                depth += 1;
            }
            b')' => {
                depth -= 1;
                if depth == 0 {
                    if let Some(open) = open_stack.pop() {
                        state.groups.push((open, i));
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }
    if let Some(start) = word_start {
        state
            .words
            .push((sql[start..].to_ascii_uppercase(), start, depth));
    }
    state.terminated_cleanly = in_quote.is_none() && !in_block_comment;
    state
}

impl ClientPrepareResult {
    /// Plain split: constant parts around each placeholder.
    pub fn parameterize(sql: &str, no_backslash_escapes: bool) -> ClientPrepareResult {
        let lex = scan(sql, no_backslash_escapes);
        let bytes = sql.as_bytes();
        let mut parts = Vec::with_capacity(lex.params.len() + 1);
        let mut prev = 0;
        for &pos in &lex.params {
            parts.push(bytes[prev..pos].to_vec());
            prev = pos + 1;
        }
        parts.push(bytes[prev..].to_vec());
        ClientPrepareResult {
            sql: sql.to_string(),
            param_count: lex.params.len(),
            query_parts: parts,
            rewrite_layout: false,
            multi_values_rewritable: false,
            multiple_queries_rewritable: lex.terminated_cleanly && !lex.has_semicolon,
        }
    }

    /// Split for batch rewriting, always producing the `param_count + 3`
    /// layout. The value-group split is used for an eligible
    /// single-value-group INSERT; every other statement gets the generic
    /// split (empty group opening, whole head in `parts[1]`), usable only
    /// for semicolon aggregation.
    pub fn rewritable(sql: &str, no_backslash_escapes: bool) -> ClientPrepareResult {
        let lex = scan(sql, no_backslash_escapes);
        let mut result = Self::parameterize(sql, no_backslash_escapes);
        if result.param_count == 0 {
            return result;
        }
        let bytes = sql.as_bytes();

        let values_split = Self::values_group_split(sql, &lex);
        if let Some((group_open, group_close)) = values_split {
            let mut parts = Vec::with_capacity(result.param_count + 3);
            parts.push(bytes[group_open..lex.params[0]].to_vec()); // group opening
            parts.push(bytes[..group_open].to_vec()); // statement head
            for window in lex.params.windows(2) {
                parts.push(bytes[window[0] + 1..window[1]].to_vec());
            }
            let last_param = *lex.params.last().unwrap();
            parts.push(bytes[last_param + 1..=group_close].to_vec()); // group closing
            parts.push(bytes[group_close + 1..].to_vec()); // trailing suffix
            result.query_parts = parts;
            result.rewrite_layout = true;
            result.multi_values_rewritable = true;
            return result;
        }

        let mut parts = Vec::with_capacity(result.param_count + 3);
        parts.push(Vec::new()); // no value group
        parts.push(bytes[..lex.params[0]].to_vec());
        for window in lex.params.windows(2) {
            parts.push(bytes[window[0] + 1..window[1]].to_vec());
        }
        parts.push(bytes[lex.params.last().unwrap() + 1..].to_vec());
        parts.push(Vec::new());
        result.query_parts = parts;
        result.rewrite_layout = true;
        result
    }

    /// Locate the single `VALUES (…)` group of an INSERT whose duplication
    /// is semantically safe.
    fn values_group_split(sql: &str, lex: &LexerScan) -> Option<(usize, usize)> {
        if !lex.terminated_cleanly || lex.has_semicolon {
            return None;
        }
        let (first_word, _, _) = lex.words.first()?;
        if first_word != "INSERT" {
            return None;
        }
        // concatenating value groups changes these statements' meaning
        if lex.words.iter().any(|(w, _, _)| w == "SELECT") {
            return None;
        }
        let (_, values_pos, _) = lex
            .words
            .iter()
            .find(|(w, _, depth)| *depth == 0 && (w == "VALUES" || w == "VALUE"))?;

        let (group_open, group_close) = *lex.groups.iter().find(|(open, _)| open > values_pos)?;
        if lex.params.is_empty()
            || !lex
                .params
                .iter()
                .all(|&p| p > group_open && p < group_close)
        {
            return None;
        }
        if lex
            .words
            .iter()
            .any(|(w, pos, _)| w == "LAST_INSERT_ID" && *pos > group_open && *pos < group_close)
        {
            return None;
        }
        // anything after the group (a second group, ON DUPLICATE KEY UPDATE)
        // makes duplication of the value group unsafe
        if !sql[group_close + 1..].trim().is_empty() {
            return None;
        }
        Some((group_open, group_close))
    }

    /// True when a statement can be concatenated into a `stmt1;stmt2;…`
    /// aggregate: the scan must finish outside strings and comments.
    pub fn can_aggregate_semicolon(sql: &str, no_backslash_escapes: bool) -> bool {
        scan(sql, no_backslash_escapes).terminated_cleanly
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn query_parts(&self) -> &[Vec<u8>] {
        &self.query_parts
    }

    pub fn param_count(&self) -> usize {
        self.param_count
    }

    pub fn is_rewrite_layout(&self) -> bool {
        self.rewrite_layout
    }

    pub fn is_query_multi_values_rewritable(&self) -> bool {
        self.multi_values_rewritable
    }

    pub fn is_query_multiple_rewritable(&self) -> bool {
        self.multiple_queries_rewritable
    }

    /// Assemble the final query: constant parts concatenated with rendered
    /// parameters, no additional whitespace.
    pub fn assemble(
        &self,
        parameters: &mut [ParameterHolder],
        no_backslash_escapes: bool,
    ) -> Result<Vec<u8>> {
        if parameters.len() != self.param_count {
            return Err(SqlError::invalid_argument(format!(
                "Parameter at position {} is not set",
                parameters.len() + 1
            )));
        }
        let mut out = Vec::with_capacity(self.sql.len() + parameters.len() * 8);
        if self.rewrite_layout {
            out.extend_from_slice(&self.query_parts[1]);
            out.extend_from_slice(&self.query_parts[0]);
            for (i, param) in parameters.iter_mut().enumerate() {
                param.write_text(&mut out, no_backslash_escapes)?;
                out.extend_from_slice(&self.query_parts[i + 2]);
            }
            out.extend_from_slice(&self.query_parts[self.param_count + 2]);
        } else {
            for (i, param) in parameters.iter_mut().enumerate() {
                out.extend_from_slice(&self.query_parts[i]);
                param.write_text(&mut out, no_backslash_escapes)?;
            }
            out.extend_from_slice(&self.query_parts[self.param_count]);
        }
        Ok(out)
    }
}

/// Pack as many parameter sets as fit under `max_allowed_packet` into one
/// physical statement, starting at `current_index`. Returns the index of
/// the first unconsumed parameter set.
///
/// `rewrite_values` concatenates value groups (`INSERT … VALUES (..),(..)`);
/// otherwise whole statements are joined with `;`.
pub fn rewrite_query(
    out: &mut Vec<u8>,
    prepare_result: &ClientPrepareResult,
    current_index: usize,
    parameter_list: &mut [Vec<ParameterHolder>],
    rewrite_values: bool,
    max_allowed_packet: usize,
    no_backslash_escapes: bool,
) -> Result<usize> {
    let parts = prepare_result.query_parts();
    let param_count = prepare_result.param_count();
    let mut index = current_index;

    let head = &parts[1];
    let opening = &parts[0];

    let check_remaining = |len: usize| len < max_allowed_packet;

    let write_group = |out: &mut Vec<u8>,
                       parameters: &mut [ParameterHolder]|
     -> Result<()> {
        for (i, param) in parameters.iter_mut().enumerate() {
            param.write_text(out, no_backslash_escapes)?;
            out.extend_from_slice(&parts[i + 2]);
        }
        Ok(())
    };

    let known_parameter_size = |parameters: &[ParameterHolder]| -> Option<i64> {
        let mut total = 0i64;
        for param in parameters {
            let size = param.approximate_text_len();
            if size == -1 {
                return None;
            }
            total += size;
        }
        Some(total)
    };

    if !rewrite_values {
        // stmt1;stmt2;… aggregation
        let static_len: usize = parts.iter().map(|p| p.len()).sum::<usize>() + 1;

        out.extend_from_slice(head);
        out.extend_from_slice(opening);
        write_group(out, &mut parameter_list[index])?;
        out.extend_from_slice(&parts[param_count + 2]);
        index += 1;

        while index < parameter_list.len() {
            let parameter_len = known_parameter_size(&parameter_list[index]);
            match parameter_len {
                Some(len)
                    if !check_remaining(out.len() + static_len + len as usize) =>
                {
                    break
                }
                _ => {}
            }
            out.push(b';');
            out.extend_from_slice(head);
            out.extend_from_slice(opening);
            write_group(out, &mut parameter_list[index])?;
            out.extend_from_slice(&parts[param_count + 2]);
            let unknown = parameter_len.is_none();
            index += 1;
            if unknown {
                break;
            }
        }
    } else {
        // INSERT … VALUES (..),(..),… concatenation
        let closing_len = parts[param_count + 2].len();
        let intermediate_len: usize =
            opening.len() + (2..=param_count + 1).map(|i| parts[i].len()).sum::<usize>();

        out.extend_from_slice(head);
        out.extend_from_slice(opening);
        write_group(out, &mut parameter_list[index])?;
        index += 1;

        while index < parameter_list.len() {
            let parameter_len = known_parameter_size(&parameter_list[index]);
            match parameter_len {
                Some(len)
                    if !check_remaining(
                        out.len() + 1 + len as usize + intermediate_len + closing_len,
                    ) =>
                {
                    break
                }
                _ => {}
            }
            out.push(b',');
            out.extend_from_slice(opening);
            write_group(out, &mut parameter_list[index])?;
            let unknown = parameter_len.is_none();
            index += 1;
            if unknown {
                break;
            }
        }
        out.extend_from_slice(&parts[param_count + 2]);
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join_with_question_marks(parts: &[Vec<u8>]) -> String {
        let joined = parts
            .iter()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect::<Vec<_>>()
            .join("?");
        joined
    }

    #[test]
    pub fn test_split_outside_quotes_and_comments() {
        let sql = "SELECT '?', \"?\", `a?b`, /* ? */ c -- ?\n FROM t WHERE a=? AND b=?";
        let result = ClientPrepareResult::parameterize(sql, false);
        assert_eq!(result.param_count(), 2);
        // invariant: join(parts, '?') == sql
        assert_eq!(join_with_question_marks(result.query_parts()), sql);
    }

    #[test]
    pub fn test_hash_comment_and_escaped_quote() {
        let sql = "SELECT 'it''s ?', 'a\\'? ' # trailing ?\n";
        let result = ClientPrepareResult::parameterize(sql, false);
        assert_eq!(result.param_count(), 0);
    }

    #[test]
    pub fn test_backslash_honored_only_when_enabled() {
        // with NO_BACKSLASH_ESCAPES '\' ends nothing: quote closes at second '
        let sql = r"SELECT '\' WHERE a=?";
        let with_backslash = ClientPrepareResult::parameterize(sql, false);
        // the backslash swallows the quote: placeholder stays inside the string
        assert_eq!(with_backslash.param_count(), 0);
        let without_backslash = ClientPrepareResult::parameterize(sql, true);
        assert_eq!(without_backslash.param_count(), 1);
    }

    #[test]
    pub fn test_rewritable_insert_layout() {
        let sql = "INSERT INTO t(id, v) VALUES (?, ?)";
        let result = ClientPrepareResult::rewritable(sql, false);
        assert!(result.is_query_multi_values_rewritable());
        assert_eq!(result.param_count(), 2);
        assert_eq!(result.query_parts().len(), 5);
        assert_eq!(result.query_parts()[1], b"INSERT INTO t(id, v) VALUES ");
        assert_eq!(result.query_parts()[0], b"(");
        assert_eq!(result.query_parts()[2], b", ");
        assert_eq!(result.query_parts()[3], b")");
        assert_eq!(result.query_parts()[4], b"");
    }

    #[test]
    pub fn test_not_rewritable_cases() {
        for sql in [
            "UPDATE t SET a=?",
            "INSERT INTO t SELECT ? FROM dual",
            "INSERT INTO t VALUES (?) ON DUPLICATE KEY UPDATE v=1",
            "INSERT INTO t VALUES (?), (?)",
            "INSERT INTO t VALUES (LAST_INSERT_ID(), ?)",
        ] {
            let result = ClientPrepareResult::rewritable(sql, false);
            assert!(
                !result.is_query_multi_values_rewritable(),
                "unexpectedly rewritable: {sql}"
            );
        }
    }

    #[test]
    pub fn test_semicolon_aggregation_check() {
        assert!(ClientPrepareResult::can_aggregate_semicolon(
            "INSERT INTO t VALUES (1)",
            false
        ));
        assert!(!ClientPrepareResult::can_aggregate_semicolon(
            "INSERT INTO t VALUES ('unterminated",
            false
        ));
        assert!(!ClientPrepareResult::can_aggregate_semicolon(
            "SELECT /* open comment",
            false
        ));
    }

    #[test]
    pub fn test_assemble_client_prepared() {
        let result = ClientPrepareResult::parameterize("SELECT ?, ?", false);
        let mut params = vec![
            ParameterHolder::Int(5),
            ParameterHolder::Text("a'b".to_string()),
        ];
        let sql = result.assemble(&mut params, false).unwrap();
        assert_eq!(sql, b"SELECT 5, 'a\\'b'".to_vec());
    }

    #[test]
    pub fn test_assemble_missing_parameter() {
        let result = ClientPrepareResult::parameterize("SELECT ?, ?", false);
        let mut params = vec![ParameterHolder::Int(5)];
        assert!(result.assemble(&mut params, false).is_err());
    }

    #[test]
    pub fn test_rewrite_multi_values_packing() {
        let prepare = ClientPrepareResult::rewritable("INSERT INTO t VALUES(?,?)", false);
        assert!(prepare.is_query_multi_values_rewritable());
        let mut parameter_list = vec![
            vec![
                ParameterHolder::Int(1),
                ParameterHolder::Text("'".to_string()),
            ],
            vec![
                ParameterHolder::Int(2),
                ParameterHolder::Text("\"".to_string()),
            ],
            vec![
                ParameterHolder::Int(3),
                ParameterHolder::Text(";".to_string()),
            ],
        ];
        let mut out = Vec::new();
        let consumed = rewrite_query(
            &mut out,
            &prepare,
            0,
            &mut parameter_list,
            true,
            1 << 20,
            false,
        )
        .unwrap();
        assert_eq!(consumed, 3);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "INSERT INTO t VALUES(1,'\\''),(2,'\\\"'),(3,';')"
        );
    }

    #[test]
    pub fn test_rewrite_respects_max_allowed_packet() {
        let prepare = ClientPrepareResult::rewritable("INSERT INTO t VALUES(?)", false);
        let mut parameter_list: Vec<Vec<ParameterHolder>> = (0..100)
            .map(|i| vec![ParameterHolder::Text(format!("value-{i:04}"))])
            .collect();
        let mut consumed = 0;
        let mut statements = 0;
        while consumed < parameter_list.len() {
            let mut out = Vec::new();
            consumed = rewrite_query(
                &mut out,
                &prepare,
                consumed,
                &mut parameter_list,
                true,
                200,
                false,
            )
            .unwrap();
            assert!(out.len() < 220, "statement exceeds packet cap: {}", out.len());
            statements += 1;
        }
        assert!(statements > 1);
    }

    #[test]
    pub fn test_rewrite_semicolon_aggregation() {
        let prepare = ClientPrepareResult::rewritable("UPDATE t SET v=? WHERE id=?", false);
        assert!(!prepare.is_query_multi_values_rewritable());
        assert!(prepare.is_query_multiple_rewritable());
        let mut parameter_list = vec![
            vec![
                ParameterHolder::Text("a".to_string()),
                ParameterHolder::Int(1),
            ],
            vec![
                ParameterHolder::Text("b".to_string()),
                ParameterHolder::Int(2),
            ],
        ];
        let mut out = Vec::new();
        let consumed = rewrite_query(
            &mut out,
            &prepare,
            0,
            &mut parameter_list,
            false,
            1 << 20,
            false,
        )
        .unwrap();
        assert_eq!(consumed, 2);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "UPDATE t SET v='a' WHERE id=1;UPDATE t SET v='b' WHERE id=2"
        );
    }
}
