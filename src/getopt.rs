//! Short/long command-line option scanner for the driver tools.
//!
//! Grammar: `-x`, `-xvalue`, `-x value`, `--long`, `--long=value`,
//! `--long value`. `--` terminates option parsing and is consumed; a bare
//! `-` also terminates but is left for the caller. Options declared
//! [`ArgStyle::None`] never consume a following token; [`ArgStyle::Optional`]
//! options attach the next token only when it does not itself look like an
//! option.

use crate::error::StoreError;

/// Whether an option takes an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgStyle {
    None,
    Required,
    Optional,
}

/// One recognised option. `id` is an arbitrary caller-chosen tag returned
/// in the [`OptMatch`].
#[derive(Debug, Clone, Copy)]
pub struct OptSpec {
    pub id: u32,
    pub short: Option<char>,
    pub long: Option<&'static str>,
    pub style: ArgStyle,
}

impl OptSpec {
    pub const fn short(id: u32, ch: char, style: ArgStyle) -> Self {
        Self { id, short: Some(ch), long: None, style }
    }

    pub const fn long(id: u32, name: &'static str, style: ArgStyle) -> Self {
        Self { id, short: None, long: Some(name), style }
    }

    pub const fn both(id: u32, ch: char, name: &'static str, style: ArgStyle) -> Self {
        Self { id, short: Some(ch), long: Some(name), style }
    }
}

/// A recognised option occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptMatch<'a> {
    pub id: u32,
    pub arg: Option<&'a str>,
}

/// Scanner over an argument list. Feed it `argv[1..]`; after `next`
/// returns `Ok(None)`, [`OptParser::index`] is the position of the first
/// operand.
pub struct OptParser<'a> {
    specs: &'a [OptSpec],
    args: &'a [String],
    next: usize,
}

/// True when a token would itself parse as an option (long or short).
fn looks_like_option(tok: &str) -> bool {
    tok.len() > 1 && tok.starts_with('-')
}

impl<'a> OptParser<'a> {
    pub fn new(specs: &'a [OptSpec], args: &'a [String]) -> Self {
        Self { specs, args, next: 0 }
    }

    /// Index into the argument list of the next unconsumed token.
    pub fn index(&self) -> usize {
        self.next
    }

    /// Scan the next option. `Ok(None)` means option parsing is over.
    pub fn next(&mut self) -> Result<Option<OptMatch<'a>>, StoreError> {
        let Some(tok) = self.args.get(self.next) else {
            return Ok(None);
        };
        if tok == "-" || !tok.starts_with('-') {
            return Ok(None);
        }
        if tok == "--" {
            self.next += 1;
            return Ok(None);
        }
        if let Some(body) = tok.strip_prefix("--") {
            self.next_long(body)
        } else {
            self.next_short(tok)
        }
    }

    fn next_long(&mut self, body: &'a str) -> Result<Option<OptMatch<'a>>, StoreError> {
        let (name, inline) = match body.split_once('=') {
            Some((n, v)) => (n, Some(v)),
            None => (body, None),
        };
        let spec = self
            .specs
            .iter()
            .find(|s| s.long == Some(name))
            .copied()
            .ok_or_else(|| StoreError::UnknownOption(format!("--{name}")))?;
        self.next += 1;
        let arg = self.capture_arg(&spec, inline)?;
        Ok(Some(OptMatch { id: spec.id, arg }))
    }

    fn next_short(&mut self, tok: &'a str) -> Result<Option<OptMatch<'a>>, StoreError> {
        let mut chars = tok[1..].chars();
        let ch = match chars.next() {
            Some(c) => c,
            None => return Ok(None),
        };
        let rest = chars.as_str();
        let inline = if rest.is_empty() { None } else { Some(rest) };
        let spec = self
            .specs
            .iter()
            .find(|s| s.short == Some(ch))
            .copied()
            .ok_or_else(|| StoreError::UnknownOption(format!("-{ch}")))?;
        self.next += 1;
        let arg = self.capture_arg(&spec, inline)?;
        Ok(Some(OptMatch { id: spec.id, arg }))
    }

    /// Resolve the argument for a matched option, consuming a following
    /// token where the style calls for it.
    fn capture_arg(
        &mut self,
        spec: &OptSpec,
        inline: Option<&'a str>,
    ) -> Result<Option<&'a str>, StoreError> {
        match spec.style {
            ArgStyle::None => {
                if inline.is_some() {
                    return Err(StoreError::Invalid("option does not take an argument"));
                }
                Ok(None)
            }
            ArgStyle::Required => {
                if inline.is_some() {
                    return Ok(inline);
                }
                match self.args.get(self.next) {
                    Some(tok) => {
                        self.next += 1;
                        Ok(Some(tok.as_str()))
                    }
                    None => Err(StoreError::MissingArg(self.describe(spec))),
                }
            }
            ArgStyle::Optional => {
                if inline.is_some() {
                    return Ok(inline);
                }
                match self.args.get(self.next) {
                    Some(tok) if !looks_like_option(tok) => {
                        self.next += 1;
                        Ok(Some(tok.as_str()))
                    }
                    _ => Ok(None),
                }
            }
        }
    }

    fn describe(&self, spec: &OptSpec) -> String {
        match (spec.short, spec.long) {
            (_, Some(name)) => format!("--{name}"),
            (Some(ch), None) => format!("-{ch}"),
            (None, None) => String::from("<unnamed>"),
        }
    }
}
