// File Commands
// Parses the output, env and path files a step appends to

use std::collections::BTreeMap;

/// Parse `name=value` and `name<<DELIM ... DELIM` entries.
///
/// Later entries for the same name win.
pub fn parse_key_values(content: &str) -> Result<BTreeMap<String, String>, String> {
    let mut values = BTreeMap::new();
    let mut lines = content.lines();

    while let Some(line) = lines.next() {
        if line.trim().is_empty() {
            continue;
        }

        let equals = line.find('=');
        let heredoc = line.find("<<");
        let is_heredoc = match (heredoc, equals) {
            (Some(h), Some(e)) => h < e,
            (Some(_), None) => true,
            _ => false,
        };

        if is_heredoc {
            let (name, delimiter) = line
                .split_once("<<")
                .map(|(n, d)| (n.trim(), d.trim()))
                .unwrap_or_default();
            if name.is_empty() || delimiter.is_empty() {
                return Err(format!("invalid heredoc line '{}'", line));
            }

            let mut body = Vec::new();
            let mut closed = false;
            for inner in lines.by_ref() {
                if inner == delimiter {
                    closed = true;
                    break;
                }
                body.push(inner);
            }
            if !closed {
                return Err(format!(
                    "missing delimiter '{}' for '{}'",
                    delimiter, name
                ));
            }
            values.insert(name.to_string(), body.join("\n"));
        } else {
            let (name, value) = line
                .split_once('=')
                .ok_or_else(|| format!("invalid line '{}', expected name=value", line))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(format!("invalid line '{}', empty name", line));
            }
            values.insert(name.to_string(), value.to_string());
        }
    }

    Ok(values)
}

/// One directory per non-empty line
pub fn parse_paths(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_values() {
        let parsed = parse_key_values("version=1.2.3\nempty=\n\nurl=http://x?a=b\n").unwrap();
        assert_eq!(parsed["version"], "1.2.3");
        assert_eq!(parsed["empty"], "");
        assert_eq!(parsed["url"], "http://x?a=b");
    }

    #[test]
    fn test_heredoc() {
        let content = "notes<<EOF\nline one\nline=two\nEOF\nafter=yes\n";
        let parsed = parse_key_values(content).unwrap();
        assert_eq!(parsed["notes"], "line one\nline=two");
        assert_eq!(parsed["after"], "yes");
    }

    #[test]
    fn test_value_containing_heredoc_marker() {
        let parsed = parse_key_values("shift=a<<b\n").unwrap();
        assert_eq!(parsed["shift"], "a<<b");
    }

    #[test]
    fn test_last_write_wins() {
        let parsed = parse_key_values("a=1\na=2\n").unwrap();
        assert_eq!(parsed["a"], "2");
    }

    #[test]
    fn test_errors() {
        assert!(parse_key_values("no equals sign").is_err());
        assert!(parse_key_values("body<<END\nnever closed\n").is_err());
        assert!(parse_key_values("=value").is_err());
    }

    #[test]
    fn test_paths() {
        assert_eq!(
            parse_paths("/opt/tool/bin\n\n  /usr/local/go/bin  \n"),
            vec!["/opt/tool/bin", "/usr/local/go/bin"]
        );
    }
}
