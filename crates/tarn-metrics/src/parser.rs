//! Line-oriented parser for the Prometheus text exposition format.
//!
//! Only what the controller needs: metric name, labels, and value.
//! Comments, `# HELP`/`# TYPE` lines, and malformed lines are skipped.
//! Trailing timestamps are ignored.

use std::iter::Peekable;
use std::str::CharIndices;

/// One sample line, e.g. `nv_gpu_utilization{gpu="0"} 45.5`.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub value: f64,
}

impl Sample {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Parse every well-formed sample line in `text`.
pub fn parse_exposition(text: &str) -> Vec<Sample> {
    text.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<Sample> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let name_end = line
        .find(|c: char| c == '{' || c.is_whitespace())
        .unwrap_or(line.len());
    let name = &line[..name_end];
    if name.is_empty() || !name.chars().all(is_name_char) {
        return None;
    }

    let mut rest = &line[name_end..];
    let mut labels = Vec::new();
    if rest.starts_with('{') {
        let consumed = parse_labels(rest, &mut labels)?;
        rest = &rest[consumed..];
    }

    let value = rest.split_whitespace().next()?;
    Some(Sample {
        name: name.to_string(),
        labels,
        value: parse_value(value)?,
    })
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == ':'
}

/// Parse `{k="v",...}` at the start of `s`. Returns bytes consumed.
fn parse_labels(s: &str, labels: &mut Vec<(String, String)>) -> Option<usize> {
    let mut chars = s.char_indices().peekable();
    chars.next(); // '{'

    loop {
        skip_separators(&mut chars);
        let (start, c) = *chars.peek()?;
        if c == '}' {
            return Some(start + 1);
        }

        let mut key = String::new();
        while let Some(&(_, c)) = chars.peek() {
            if c == '=' || c.is_whitespace() {
                break;
            }
            key.push(c);
            chars.next();
        }
        skip_whitespace(&mut chars);
        if chars.next()?.1 != '=' {
            return None;
        }
        skip_whitespace(&mut chars);
        if chars.next()?.1 != '"' {
            return None;
        }

        let mut value = String::new();
        loop {
            match chars.next()?.1 {
                '"' => break,
                '\\' => match chars.next()?.1 {
                    'n' => value.push('\n'),
                    other => value.push(other),
                },
                c => value.push(c),
            }
        }
        if key.is_empty() {
            return None;
        }
        labels.push((key, value));
    }
}

fn skip_whitespace(chars: &mut Peekable<CharIndices<'_>>) {
    while chars.peek().is_some_and(|&(_, c)| c.is_whitespace()) {
        chars.next();
    }
}

fn skip_separators(chars: &mut Peekable<CharIndices<'_>>) {
    while chars.peek().is_some_and(|&(_, c)| c == ',' || c.is_whitespace()) {
        chars.next();
    }
}

fn parse_value(token: &str) -> Option<f64> {
    match token {
        "+Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        _ => token.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_triton_sample_block() {
        let text = r#"
# HELP nv_gpu_utilization GPU utilization rate [0.0 - 1.0)
# TYPE nv_gpu_utilization gauge
nv_gpu_utilization{gpu_uuid="GPU-1a2b"} 45.5
nv_inference_request_success{model="llama",version="1"} 1200
nv_inference_count{model="llama",version="1"} 1250 1712345678000
"#;
        let samples = parse_exposition(text);
        assert_eq!(samples.len(), 3);

        assert_eq!(samples[0].name, "nv_gpu_utilization");
        assert_eq!(samples[0].label("gpu_uuid"), Some("GPU-1a2b"));
        assert_eq!(samples[0].value, 45.5);

        assert_eq!(samples[1].label("model"), Some("llama"));
        assert_eq!(samples[1].label("version"), Some("1"));
        assert_eq!(samples[2].value, 1250.0);
    }

    #[test]
    fn unlabelled_and_special_values() {
        let samples = parse_exposition("up 1\nlat_bucket{le=\"+Inf\"} +Inf\nmissing NaN\n");
        assert_eq!(samples[0].name, "up");
        assert!(samples[0].labels.is_empty());
        assert_eq!(samples[1].label("le"), Some("+Inf"));
        assert!(samples[1].value.is_infinite());
        assert!(samples[2].value.is_nan());
    }

    #[test]
    fn escaped_label_values() {
        let samples = parse_exposition(r#"m{path="a\"b\\c",note="x\ny"} 2"#);
        assert_eq!(samples[0].label("path"), Some(r#"a"b\c"#));
        assert_eq!(samples[0].label("note"), Some("x\ny"));
    }

    #[test]
    fn braces_inside_label_values_do_not_end_the_set() {
        let samples = parse_exposition(r#"m{q="{}"} 3"#);
        assert_eq!(samples[0].label("q"), Some("{}"));
        assert_eq!(samples[0].value, 3.0);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let text = "good 1\nno_value\nbad{unterminated=\"x} 2\n{\"nameless\"} 4\nalso_good{a=\"b\",} 5\nnot_a_number abc\n";
        let names: Vec<_> = parse_exposition(text).into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["good", "also_good"]);
    }

    #[test]
    fn empty_input() {
        assert!(parse_exposition("").is_empty());
        assert!(parse_exposition("# only comments\n\n").is_empty());
    }
}
