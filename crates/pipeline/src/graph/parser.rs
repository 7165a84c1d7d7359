//! Filter graph description parser.
//!
//! ```text
//! description := chain (';' chain)*
//! chain       := filter (',' filter)*
//! filter      := label* name ('=' args)? label*
//! args        := arg (':' arg)*
//! arg         := value | key '=' value
//! label       := '[' ident ']'
//! ```
//!
//! Values may be quoted with `'...'`, and `\` escapes the next character.

use capline_common::{MediaError, MediaResult};

/// One argument of a filter: positional (`640`) or named (`w=640`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterArg {
    pub key: Option<String>,
    pub value: String,
}

/// A filter instance as written in the description.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterSpec {
    pub name: String,
    pub args: Vec<FilterArg>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl FilterSpec {
    /// Value of a `key=value` argument.
    pub fn named(&self, name: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|a| a.key.as_deref() == Some(name))
            .map(|a| a.value.as_str())
    }

    /// Look up an argument by name, falling back to its position.
    pub fn arg(&self, position: usize, name: &str) -> Option<&str> {
        self.named(name).or_else(|| {
            self.args
                .iter()
                .filter(|a| a.key.is_none())
                .nth(position)
                .map(|a| a.value.as_str())
        })
    }
}

/// A `,`-separated run of filters.
pub type Chain = Vec<FilterSpec>;

/// Parse a full description into chains. Whitespace around tokens is ignored.
pub fn parse_graph(desc: &str) -> MediaResult<Vec<Chain>> {
    let mut parser = Parser {
        src: desc.as_bytes(),
        pos: 0,
    };
    parser.graph()
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn error(&self, what: &str) -> MediaError {
        MediaError::graph_parse(format!("{what} at offset {}", self.pos))
    }

    fn graph(&mut self) -> MediaResult<Vec<Chain>> {
        let mut chains = vec![self.chain()?];
        loop {
            self.skip_ws();
            match self.peek() {
                None => return Ok(chains),
                Some(b';') => {
                    self.pos += 1;
                    chains.push(self.chain()?);
                }
                Some(c) => return Err(self.error(&format!("unexpected '{}'", c as char))),
            }
        }
    }

    fn chain(&mut self) -> MediaResult<Chain> {
        let mut filters = vec![self.filter()?];
        loop {
            self.skip_ws();
            if self.peek() == Some(b',') {
                self.pos += 1;
                filters.push(self.filter()?);
            } else {
                return Ok(filters);
            }
        }
    }

    fn filter(&mut self) -> MediaResult<FilterSpec> {
        let inputs = self.labels()?;
        self.skip_ws();
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_')
        {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.error("expected filter name"));
        }
        let name = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();

        let args = if self.peek() == Some(b'=') {
            self.pos += 1;
            self.args()?
        } else {
            Vec::new()
        };
        let outputs = self.labels()?;
        Ok(FilterSpec {
            name,
            args,
            inputs,
            outputs,
        })
    }

    fn labels(&mut self) -> MediaResult<Vec<String>> {
        let mut labels = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() != Some(b'[') {
                return Ok(labels);
            }
            self.pos += 1;
            let start = self.pos;
            loop {
                match self.peek() {
                    None => return Err(self.error("unterminated '['")),
                    Some(b']') => break,
                    Some(c) if c.is_ascii_alphanumeric() || c == b'_' => self.pos += 1,
                    Some(c) => {
                        return Err(self.error(&format!("invalid character '{}' in label", c as char)))
                    }
                }
            }
            if self.pos == start {
                return Err(self.error("empty label"));
            }
            labels.push(String::from_utf8_lossy(&self.src[start..self.pos]).into_owned());
            self.pos += 1;
        }
    }

    /// Raw argument text up to the next top-level separator, split on ':'.
    fn args(&mut self) -> MediaResult<Vec<FilterArg>> {
        let mut parts = Vec::new();
        let mut current = String::new();
        let mut quoted = false;
        loop {
            match self.peek() {
                None if quoted => return Err(self.error("unterminated quote")),
                None => break,
                Some(b'\'') => {
                    quoted = !quoted;
                    self.pos += 1;
                }
                Some(b'\\') => {
                    self.pos += 1;
                    let c = self.peek().ok_or_else(|| self.error("dangling escape"))?;
                    current.push(c as char);
                    self.pos += 1;
                }
                Some(b',' | b';' | b'[') if !quoted => break,
                Some(b':') if !quoted => {
                    parts.push(std::mem::take(&mut current));
                    self.pos += 1;
                }
                Some(c) => {
                    current.push(c as char);
                    self.pos += 1;
                }
            }
        }
        parts.push(current);

        parts
            .into_iter()
            .map(|raw| {
                let raw = raw.trim();
                if raw.is_empty() {
                    return Err(self.error("empty filter argument"));
                }
                let arg = match raw.split_once('=') {
                    Some((key, value))
                        if !key.is_empty()
                            && key.bytes().all(|c| c.is_ascii_alphanumeric() || c == b'_') =>
                    {
                        FilterArg {
                            key: Some(key.to_string()),
                            value: value.trim().to_string(),
                        }
                    }
                    _ => FilterArg {
                        key: None,
                        value: raw.to_string(),
                    },
                };
                Ok(arg)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_filter_without_args() {
        let chains = parse_graph("hflip").unwrap();
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0][0].name, "hflip");
        assert!(chains[0][0].args.is_empty());
    }

    #[test]
    fn chain_with_positional_and_named_args() {
        let chains = parse_graph("scale=640:h=480, fps=30000/1001").unwrap();
        let scale = &chains[0][0];
        assert_eq!(scale.arg(0, "w"), Some("640"));
        assert_eq!(scale.arg(1, "h"), Some("480"));
        assert_eq!(chains[0][1].arg(0, "fps"), Some("30000/1001"));
    }

    #[test]
    fn labels_and_multiple_chains() {
        let chains = parse_graph("[in0]hflip[a]; [a][in1] overlay=10:20 [out]").unwrap();
        assert_eq!(chains.len(), 2);
        assert_eq!(chains[0][0].inputs, vec!["in0"]);
        assert_eq!(chains[0][0].outputs, vec!["a"]);
        assert_eq!(chains[1][0].inputs, vec!["a", "in1"]);
        assert_eq!(chains[1][0].outputs, vec!["out"]);
    }

    #[test]
    fn quoted_values_keep_separators() {
        let chains = parse_graph("volume='0.5:x'").unwrap();
        assert_eq!(chains[0][0].args[0].value, "0.5:x");
    }

    #[test]
    fn negative_decibels_are_positional() {
        let chains = parse_graph("volume=-6dB").unwrap();
        assert_eq!(chains[0][0].arg(0, "volume"), Some("-6dB"));
    }

    #[test]
    fn malformed_descriptions() {
        for bad in [
            ",",
            "hflip,",
            "hflip;;vflip",
            "[in0 hflip",
            "[]hflip",
            "scale=640:",
            "volume='0.5",
            "hflip vflip",
            "[a-b]null",
        ] {
            let err = parse_graph(bad).unwrap_err();
            assert!(
                matches!(err, MediaError::GraphParse(_)),
                "{bad:?} gave {err:?}"
            );
        }
    }
}
