//! CSV field codec for protocol lines.
//!
//! Non-null values are always quoted. Inside quotes `\` and `"` are escaped
//! with a backslash, and line breaks are written as `\n` and `\r` so a value
//! never spans protocol lines. An unquoted empty field is NULL and `""` is
//! the empty string.

/// Quote one value. `None` encodes as an empty unquoted field.
pub fn escape_field(value: Option<&str>) -> String {
    match value {
        None => String::new(),
        Some(v) => {
            let mut out = String::with_capacity(v.len() + 2);
            out.push('"');
            for c in v.chars() {
                match c {
                    '"' | '\\' => {
                        out.push('\\');
                        out.push(c);
                    }
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    _ => out.push(c),
                }
            }
            out.push('"');
            out
        }
    }
}

/// `token,v1,v2,...` with every value quoted.
pub fn format_row(token: &str, values: &[Option<String>]) -> String {
    let mut line = String::from(token);
    for v in values {
        line.push(',');
        line.push_str(&escape_field(v.as_deref()));
    }
    line
}

/// `token,name1,name2,...` with bare names.
pub fn format_names(token: &str, names: &[String]) -> String {
    let mut line = String::from(token);
    for n in names {
        line.push(',');
        line.push_str(n);
    }
    line
}

/// Split a line into fields.
pub fn split_line(line: &str) -> Result<Vec<Option<String>>, String> {
    let mut fields = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        let field = if chars.peek() == Some(&'"') {
            chars.next();
            let mut value = String::new();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some('n') => value.push('\n'),
                        Some('r') => value.push('\r'),
                        Some(escaped) => value.push(escaped),
                        None => return Err("dangling escape at end of line".to_string()),
                    },
                    '"' => {
                        closed = true;
                        break;
                    }
                    _ => value.push(c),
                }
            }
            if !closed {
                return Err("unterminated quoted field".to_string());
            }
            match chars.peek() {
                None | Some(',') => {}
                Some(c) => return Err(format!("unexpected '{}' after quoted field", c)),
            }
            Some(value)
        } else {
            let mut value = String::new();
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
            if value.is_empty() {
                None
            } else {
                Some(value)
            }
        };
        fields.push(field);

        match chars.next() {
            Some(',') => continue,
            None => break,
            Some(c) => return Err(format!("unexpected '{}'", c)),
        }
    }
    Ok(fields)
}
