//! binfmt_misc wire formats
//!
//! Two directions:
//!
//! - **Register records** written to `/register`. The first byte of the
//!   buffer picks the field delimiter, so `:name:M:0:\x7fELF::/bin/x:` and
//!   `,name,M,0,\x7fELF,,/bin/x,` are the same record. Field order is
//!   `name`, `kind`, `offset`, `magic`, `mask`, `interpreter`, `flags`.
//!   `magic` and `mask` may carry `\xHH` escapes.
//! - **Entry text** read back from `/<name>`, in the kernel's layout:
//!
//! ```text
//! enabled
//! interpreter /usr/bin/qemu-arm
//! flags: 
//! offset 0
//! magic 7f454c46
//! mask ffffffff
//! ```

use std::str;

use log::info;

use crate::adapter::{REGISTER_NAME, STATUS_NAME};
use crate::error::{BinfmtError, Result};
use crate::registry::{Binding, BindingKind, Matcher, Registry};

/// Shortest register record the kernel accepts
pub const MIN_REGISTER_LEN: usize = 11;

/// Longest register record the kernel accepts
pub const MAX_REGISTER_LEN: usize = 256;

/// Strip a single trailing newline, as left by `echo`.
#[inline]
pub fn strip_newline(buf: &[u8]) -> &[u8] {
    buf.strip_suffix(b"\n").unwrap_or(buf)
}

/// Decode `\xHH` escapes into raw bytes.
///
/// Anything that is not an escape passes through unchanged, including a
/// lone backslash. A `\x` that is not followed by two hex digits is an error.
pub fn decode_escapes(field: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(field.len());
    let mut i = 0;

    while i < field.len() {
        if field[i] == b'\\' && field.get(i + 1) == Some(&b'x') {
            let digits = field
                .get(i + 2..i + 4)
                .ok_or(BinfmtError::InvalidArgument("truncated escape"))?;
            let mut byte = [0u8; 1];
            hex::decode_to_slice(digits, &mut byte)
                .map_err(|_| BinfmtError::InvalidArgument("bad escape"))?;
            out.push(byte[0]);
            i += 4;
        } else {
            out.push(field[i]);
            i += 1;
        }
    }

    Ok(out)
}

/// Split a register buffer on its own leading delimiter.
///
/// The empty field in front of the first delimiter is dropped.
pub fn tokenize(buf: &[u8]) -> Result<Vec<&[u8]>> {
    let delimiter = *buf
        .first()
        .ok_or(BinfmtError::InvalidArgument("empty record"))?;
    Ok(strip_newline(buf)
        .split(|&b| b == delimiter)
        .skip(1)
        .collect())
}

/// A tokenized register record, not yet validated
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterRecord<'a> {
    pub name: &'a [u8],
    pub kind: &'a [u8],
    pub offset: &'a [u8],
    pub magic: &'a [u8],
    pub mask: &'a [u8],
    pub interpreter: &'a [u8],
    pub flags: &'a [u8],
}

impl<'a> RegisterRecord<'a> {
    /// Check length bounds and arity, then slice out the fields.
    ///
    /// Fields past `flags` are ignored.
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < MIN_REGISTER_LEN || buf.len() > MAX_REGISTER_LEN {
            return Err(BinfmtError::InvalidArgument("record length out of bounds"));
        }

        let fields = tokenize(buf)?;
        let [name, kind, offset, magic, mask, interpreter, flags, ..] = fields[..] else {
            return Err(BinfmtError::InvalidArgument("too few fields"));
        };

        Ok(RegisterRecord {
            name,
            kind,
            offset,
            magic,
            mask,
            interpreter,
            flags,
        })
    }

    /// Validate every field and build the binding it describes.
    pub fn into_binding(self) -> Result<Binding> {
        let name = validate_name(self.name)?;

        let kind = BindingKind::from_tag(self.kind)
            .ok_or(BinfmtError::InvalidArgument("kind must be M or E"))?;
        if self.magic.is_empty() {
            return Err(BinfmtError::InvalidArgument("empty magic or extension"));
        }

        let matcher = match kind {
            BindingKind::Magic => {
                let offset = parse_offset(self.offset)?;
                let magic = decode_escapes(self.magic)?;
                let mask = decode_escapes(self.mask)?;
                if !mask.is_empty() && mask.len() != magic.len() {
                    return Err(BinfmtError::InvalidArgument("mask and magic differ in length"));
                }
                Matcher::Magic {
                    offset,
                    magic,
                    mask,
                }
            }
            BindingKind::Extension => {
                if self.magic.contains(&b'/') {
                    return Err(BinfmtError::InvalidArgument("extension contains '/'"));
                }
                Matcher::Extension(self.magic.to_vec())
            }
        };

        if self.interpreter.is_empty() {
            return Err(BinfmtError::InvalidArgument("empty interpreter"));
        }

        Ok(Binding {
            name: name.to_string(),
            matcher,
            interpreter: self.interpreter.to_vec(),
            flags: self.flags.to_vec(),
        })
    }
}

/// Entry names share the root directory with the control files, so those
/// names are taken.
fn validate_name(raw: &[u8]) -> Result<&str> {
    let name = str::from_utf8(raw).map_err(|_| BinfmtError::InvalidArgument("name is not UTF-8"))?;
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(BinfmtError::InvalidArgument("bad name"));
    }
    if name == REGISTER_NAME || name == STATUS_NAME {
        return Err(BinfmtError::InvalidArgument("name is reserved"));
    }
    Ok(name)
}

/// Empty means 0; otherwise a signed decimal integer that fits in an `i64`.
fn parse_offset(raw: &[u8]) -> Result<i64> {
    let text = str::from_utf8(raw)
        .map_err(|_| BinfmtError::InvalidArgument("bad offset"))?
        .trim();
    if text.is_empty() {
        return Ok(0);
    }
    text.parse()
        .map_err(|_| BinfmtError::InvalidArgument("bad offset"))
}

/// Parse a `/register` write and add the binding it describes.
///
/// Returns the number of bytes consumed (always the whole buffer). Nothing is
/// inserted unless every field validates.
pub fn register(registry: &mut Registry, buf: &[u8]) -> Result<usize> {
    let record = RegisterRecord::parse(buf)?;

    if let Ok(name) = str::from_utf8(record.name) {
        if registry.contains(name) {
            return Err(BinfmtError::AlreadyExists(name.to_string()));
        }
    }

    let binding = record.into_binding()?;
    let (name, kind) = (binding.name.clone(), binding.kind());
    registry.insert(binding)?;
    info!("registered {} (kind {})", name, kind.tag());
    Ok(buf.len())
}

/// Render a binding the way `cat /proc/sys/fs/binfmt_misc/<name>` shows it.
pub fn render_binding(binding: &Binding) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + binding.interpreter.len());

    out.extend_from_slice(b"enabled\n");
    out.extend_from_slice(b"interpreter ");
    out.extend_from_slice(&binding.interpreter);
    out.push(b'\n');
    out.extend_from_slice(b"flags: \n");

    match &binding.matcher {
        Matcher::Extension(ext) => {
            out.extend_from_slice(b"extension .");
            out.extend_from_slice(ext);
            out.push(b'\n');
        }
        Matcher::Magic {
            offset,
            magic,
            mask,
        } => {
            out.extend_from_slice(format!("offset {}\n", offset).as_bytes());
            out.extend_from_slice(format!("magic {}\n", hex::encode(magic)).as_bytes());
            if !mask.is_empty() {
                out.extend_from_slice(format!("mask {}\n", hex::encode(mask)).as_bytes());
            }
        }
    }

    out
}

/// Render the entry file for `name`.
pub fn render_entry(registry: &Registry, name: &str) -> Result<Vec<u8>> {
    registry.lookup(name).map(render_binding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_plain_and_escaped() {
        assert_eq!(decode_escapes(br"\x41\x42").unwrap(), b"AB");
        assert_eq!(decode_escapes(br"\x7fELF").unwrap(), b"\x7fELF");
        assert_eq!(decode_escapes(b"plain").unwrap(), b"plain");
        assert_eq!(decode_escapes(b"").unwrap(), b"");
    }

    #[test]
    fn test_decode_mixed_case_hex() {
        assert_eq!(decode_escapes(br"\xfF\xAa").unwrap(), vec![0xffu8, 0xaa]);
    }

    #[test]
    fn test_decode_lone_backslash_passes_through() {
        assert_eq!(decode_escapes(br"a\b").unwrap(), br"a\b");
        assert_eq!(decode_escapes(br"end\").unwrap(), br"end\");
    }

    #[test]
    fn test_decode_rejects_bad_escapes() {
        assert!(decode_escapes(br"\xZZ").is_err());
        assert!(decode_escapes(br"\x4").is_err());
        assert!(decode_escapes(br"\x").is_err());
        assert!(decode_escapes(br"ok\xg0").is_err());
    }

    #[test]
    fn test_tokenize_uses_leading_delimiter() {
        let fields = tokenize(b",a,b,,c\n").unwrap();
        assert_eq!(fields, vec![&b"a"[..], b"b", b"", b"c"]);
    }

    #[test]
    fn test_tokenize_strips_only_one_newline() {
        let fields = tokenize(b":a:b\n\n").unwrap();
        assert_eq!(fields, vec![&b"a"[..], b"b\n"]);
    }

    #[test]
    fn test_parse_record_fields() {
        let rec = RegisterRecord::parse(br":qemu-arm:M:0:\x7fELF::/usr/bin/qemu-arm:OC").unwrap();
        assert_eq!(rec.name, b"qemu-arm");
        assert_eq!(rec.kind, b"M");
        assert_eq!(rec.offset, b"0");
        assert_eq!(rec.magic, br"\x7fELF");
        assert_eq!(rec.mask, b"");
        assert_eq!(rec.interpreter, b"/usr/bin/qemu-arm");
        assert_eq!(rec.flags, b"OC");
    }

    #[test]
    fn test_parse_record_too_few_fields() {
        // six fields in total, one short
        let err = RegisterRecord::parse(b":name:E::jar::/bin/java").unwrap_err();
        assert_eq!(err, BinfmtError::InvalidArgument("too few fields"));
    }

    #[test]
    fn test_parse_record_extra_fields_ignored() {
        let rec = RegisterRecord::parse(b":jar:E::jar::/bin/java::extra").unwrap();
        assert_eq!(rec.flags, b"");
    }

    #[test]
    fn test_offset_parsing() {
        assert_eq!(parse_offset(b"").unwrap(), 0);
        assert_eq!(parse_offset(b"16").unwrap(), 16);
        assert_eq!(parse_offset(b" 4 ").unwrap(), 4);
        assert_eq!(parse_offset(b"-2").unwrap(), -2);
        assert!(parse_offset(b"0x10").is_err());
        assert!(parse_offset(b"abc").is_err());
        assert_eq!(parse_offset(b"9223372036854775807").unwrap(), i64::MAX);
        assert!(parse_offset(b"99999999999999999999").is_err());
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name(b"").is_err());
        assert!(validate_name(b".").is_err());
        assert!(validate_name(b"..").is_err());
        assert!(validate_name(b"a/b").is_err());
        assert!(validate_name(b"\xff").is_err());
        assert!(validate_name(b"register").is_err());
        assert!(validate_name(b"status").is_err());
        assert_eq!(validate_name(b"registers").unwrap(), "registers");
        assert_eq!(validate_name(b"...").unwrap(), "...");
    }

    #[test]
    fn test_register_reports_consumed_length() {
        let mut reg = Registry::new();
        let buf = b":jar:E::jar::/usr/bin/jexec:\n";
        assert_eq!(register(&mut reg, buf).unwrap(), buf.len());
        assert!(reg.contains("jar"));
    }

    #[test]
    fn test_flags_stored_verbatim() {
        let mut reg = Registry::new();
        register(&mut reg, b":jar:E::jar::/usr/bin/jexec:POCF").unwrap();
        assert_eq!(reg.lookup("jar").unwrap().flags, b"POCF");
    }

    #[test]
    fn test_render_magic_with_mask() {
        let binding = Binding {
            name: "arm".into(),
            matcher: Matcher::Magic {
                offset: 0,
                magic: vec![0x7f, b'E', b'L', b'F', 0x01],
                mask: vec![0xff, 0xff, 0xff, 0xff, 0xfe],
            },
            interpreter: b"/usr/bin/qemu-arm".to_vec(),
            flags: Vec::new(),
        };
        assert_eq!(
            render_binding(&binding),
            b"enabled\ninterpreter /usr/bin/qemu-arm\nflags: \noffset 0\nmagic 7f454c4601\nmask fffffffffe\n"
        );
    }

    #[test]
    fn test_render_extension() {
        let binding = Binding {
            name: "jar".into(),
            matcher: Matcher::Extension(b"jar".to_vec()),
            interpreter: b"/usr/bin/jexec".to_vec(),
            flags: Vec::new(),
        };
        assert_eq!(
            render_binding(&binding),
            b"enabled\ninterpreter /usr/bin/jexec\nflags: \nextension .jar\n"
        );
    }

    #[test]
    fn test_render_missing_entry() {
        let reg = Registry::new();
        assert_eq!(render_entry(&reg, "nope").unwrap_err(), BinfmtError::NotFound);
    }
}
