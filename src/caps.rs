//! Capability descriptor parsing.
//!
//! A capability descriptor is the text attached to every buffer by the transport, e.g.
//!
//! ```text
//! video/x-raw-yuv;format=(fourcc)I420;width=(int)640;height=(int)480
//! ```
//!
//! The first segment names the media family. Every other segment is `key=(type)value`,
//! in no particular order, and any of them may be missing. Segments are split on `;`
//! and on `,` (the separator GStreamer itself uses when serializing caps).
//!
//! Parsing is pure: it never logs and never touches shared state. Unknown families are
//! carried through as `MediaFamily::Other` so the resolver can reject them as unsupported.

use serde::Serialize;
use std::collections::HashSet;

use crate::error::ParseError;

pub const RGB_FAMILY: &str = "video/x-raw-rgb";
pub const YUV_FAMILY: &str = "video/x-raw-yuv";

const SEPARATORS: [char; 2] = [';', ','];

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaFamily {
    Rgb,
    Yuv,
    Other(String),
}

impl MediaFamily {
    fn from_token(token: &str) -> Self {
        match token {
            RGB_FAMILY => MediaFamily::Rgb,
            YUV_FAMILY => MediaFamily::Yuv,
            other => MediaFamily::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MediaFamily::Rgb => RGB_FAMILY,
            MediaFamily::Yuv => YUV_FAMILY,
            MediaFamily::Other(name) => name,
        }
    }
}

/// Stream format as declared by one descriptor. Every field except the family is optional.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StreamFormat {
    pub family: MediaFamily,
    pub bits_per_pixel: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub red_mask: Option<u32>,
    pub blue_mask: Option<u32>,
    pub fourcc: Option<String>,
}

impl StreamFormat {
    pub fn new(family: MediaFamily) -> Self {
        Self {
            family,
            bits_per_pixel: None,
            width: None,
            height: None,
            red_mask: None,
            blue_mask: None,
            fourcc: None,
        }
    }
}

/// `StreamFormat` slot a rule writes into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Field {
    BitsPerPixel,
    Width,
    Height,
    RedMask,
    BlueMask,
    Fourcc,
}

/// Binds a descriptor key to a `StreamFormat` field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldRule {
    pub key: String,
    pub field: Field,
}

impl FieldRule {
    pub fn new(key: impl Into<String>, field: Field) -> Self {
        Self {
            key: key.into(),
            field,
        }
    }
}

const DEFAULT_RULES: [(&str, Field); 6] = [
    ("bpp", Field::BitsPerPixel),
    ("width", Field::Width),
    ("height", Field::Height),
    ("red_mask", Field::RedMask),
    ("blue_mask", Field::BlueMask),
    ("format", Field::Fourcc),
];

/// Compiled set of field rules.
#[derive(Clone, Debug)]
pub struct CapsParser {
    rules: Vec<FieldRule>,
}

impl CapsParser {
    /// Parser for the standard field set (`bpp`, `width`, `height`, `red_mask`,
    /// `blue_mask`, `format`).
    pub fn new() -> Result<Self, ParseError> {
        Self::from_rules(
            DEFAULT_RULES
                .iter()
                .map(|(key, field)| FieldRule::new(*key, *field)),
        )
    }

    /// Compile a custom rule set. Keys must be non-empty, unique, and free of
    /// separators, `=`, parentheses and whitespace.
    pub fn from_rules(rules: impl IntoIterator<Item = FieldRule>) -> Result<Self, ParseError> {
        let rules: Vec<FieldRule> = rules.into_iter().collect();
        let mut seen = HashSet::new();
        for rule in &rules {
            validate_key(&rule.key)?;
            if !seen.insert(rule.key.as_str()) {
                return Err(ParseError::InvalidRule {
                    key: rule.key.clone(),
                    reason: "duplicate key",
                });
            }
        }
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[FieldRule] {
        &self.rules
    }

    pub fn parse(&self, descriptor: &str) -> Result<StreamFormat, ParseError> {
        let mut segments = descriptor.split(SEPARATORS);
        let family = segments.next().map(str::trim).unwrap_or_default();
        if family.is_empty() {
            return Err(ParseError::MissingFamily);
        }

        let mut format = StreamFormat::new(MediaFamily::from_token(family));
        for segment in segments {
            let Some((key, rest)) = segment.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let Some(rule) = self.rules.iter().find(|rule| rule.key == key) else {
                continue;
            };
            let value = strip_type_tag(rest);
            apply(&mut format, rule, value)?;
        }
        Ok(format)
    }
}

/// Parse a descriptor with the standard rule set.
pub fn parse(descriptor: &str) -> Result<StreamFormat, ParseError> {
    CapsParser::new()?.parse(descriptor)
}

/// Descriptor for packed 24-bit RGB, big-endian channel masks.
pub fn rgb_descriptor(width: u32, height: u32) -> String {
    format!(
        "{};bpp=(int)24;depth=(int)24;endianness=(int)4321;red_mask=(int)16711680;\
         green_mask=(int)65280;blue_mask=(int)255;width=(int){};height=(int){};\
         framerate=(fraction)0/1",
        RGB_FAMILY, width, height
    )
}

/// Descriptor for planar I420.
pub fn i420_descriptor(width: u32, height: u32) -> String {
    format!(
        "{};format=(fourcc)I420;width=(int){};height=(int){};framerate=(fraction)0/1",
        YUV_FAMILY, width, height
    )
}

fn validate_key(key: &str) -> Result<(), ParseError> {
    let reason = if key.is_empty() {
        Some("empty key")
    } else if key
        .chars()
        .any(|c| SEPARATORS.contains(&c) || matches!(c, '=' | '(' | ')') || c.is_whitespace())
    {
        Some("key contains a reserved character")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(ParseError::InvalidRule {
            key: key.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// `(int)640` -> `640`, `"I420"` -> `I420`. Untyped values pass through.
fn strip_type_tag(raw: &str) -> &str {
    let raw = raw.trim();
    let value = match raw.strip_prefix('(') {
        Some(tagged) => tagged
            .split_once(')')
            .map(|(_, value)| value)
            .unwrap_or(tagged),
        None => raw,
    };
    value.trim().trim_matches('"')
}

fn apply(format: &mut StreamFormat, rule: &FieldRule, value: &str) -> Result<(), ParseError> {
    let invalid = || ParseError::InvalidValue {
        key: rule.key.clone(),
        value: value.to_string(),
    };
    match rule.field {
        Field::BitsPerPixel => format.bits_per_pixel = Some(read_unsigned(value).ok_or_else(invalid)?),
        Field::Width => format.width = Some(read_unsigned(value).ok_or_else(invalid)?),
        Field::Height => format.height = Some(read_unsigned(value).ok_or_else(invalid)?),
        Field::RedMask => format.red_mask = Some(read_mask(value).ok_or_else(invalid)?),
        Field::BlueMask => format.blue_mask = Some(read_mask(value).ok_or_else(invalid)?),
        Field::Fourcc => {
            if value.is_empty() {
                return Err(invalid());
            }
            format.fourcc = Some(value.to_string());
        }
    }
    Ok(())
}

fn read_integer(value: &str) -> Option<i64> {
    let (negative, digits) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value.strip_prefix('+').unwrap_or(value)),
    };
    let (radix, digits) = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => (16, hex),
        None => (10, digits),
    };
    // `from_str_radix` would accept a second sign.
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    let magnitude = i64::from_str_radix(digits, radix).ok()?;
    if negative {
        magnitude.checked_neg()
    } else {
        Some(magnitude)
    }
}

fn read_unsigned(value: &str) -> Option<u32> {
    u32::try_from(read_integer(value)?).ok()
}

/// Masks are 32-bit patterns; producers sometimes serialize the high bit as a sign.
fn read_mask(value: &str) -> Option<u32> {
    let raw = read_integer(value)?;
    if raw < 0 {
        i32::try_from(raw).ok().map(|signed| signed as u32)
    } else {
        u32::try_from(raw).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rgb_descriptor() -> Result<(), ParseError> {
        let format = parse(
            "video/x-raw-rgb;bpp=(int)24;width=(int)4;height=(int)2;red_mask=(int)16711680;blue_mask=(int)255",
        )?;
        assert_eq!(format.family, MediaFamily::Rgb);
        assert_eq!(format.bits_per_pixel, Some(24));
        assert_eq!(format.width, Some(4));
        assert_eq!(format.height, Some(2));
        assert_eq!(format.red_mask, Some(0x00ff_0000));
        assert_eq!(format.blue_mask, Some(0xff));
        assert_eq!(format.fourcc, None);
        Ok(())
    }

    #[test]
    fn field_order_does_not_matter() -> Result<(), ParseError> {
        let a = parse("video/x-raw-yuv;format=(fourcc)I420;width=(int)2;height=(int)2")?;
        let b = parse("video/x-raw-yuv;height=(int)2;framerate=(fraction)30/1;width=(int)2;format=(fourcc)I420")?;
        assert_eq!(a, b);
        assert_eq!(a.fourcc.as_deref(), Some("I420"));
        Ok(())
    }

    #[test]
    fn absent_fields_stay_unset() -> Result<(), ParseError> {
        let format = parse("video/x-raw-rgb")?;
        assert_eq!(format, StreamFormat::new(MediaFamily::Rgb));
        Ok(())
    }

    #[test]
    fn gstreamer_comma_separated_caps() -> Result<(), ParseError> {
        let format = parse("video/x-raw-yuv, width=(int)320, height=(int)240, format=(fourcc)I420")?;
        assert_eq!(format.family, MediaFamily::Yuv);
        assert_eq!(format.width, Some(320));
        assert_eq!(format.height, Some(240));
        assert_eq!(format.fourcc.as_deref(), Some("I420"));
        Ok(())
    }

    #[test]
    fn unknown_family_is_not_an_error() -> Result<(), ParseError> {
        let format = parse("video/x-raw-foo;width=(int)4")?;
        assert_eq!(format.family, MediaFamily::Other("video/x-raw-foo".into()));
        assert_eq!(format.width, Some(4));
        Ok(())
    }

    #[test]
    fn missing_family_is_an_error() {
        assert_eq!(parse(""), Err(ParseError::MissingFamily));
        assert_eq!(parse(" ;width=(int)4"), Err(ParseError::MissingFamily));
    }

    #[test]
    fn last_occurrence_wins() -> Result<(), ParseError> {
        let format = parse("video/x-raw-rgb;width=(int)4;width=(int)8")?;
        assert_eq!(format.width, Some(8));
        Ok(())
    }

    #[test]
    fn keys_match_exactly() -> Result<(), ParseError> {
        let format = parse("video/x-raw-rgb;framewidth=(int)99;width=(int)4")?;
        assert_eq!(format.width, Some(4));
        Ok(())
    }

    #[test]
    fn unreadable_integer_is_structural() {
        let err = parse("video/x-raw-rgb;width=(int)wide").unwrap_err();
        assert_eq!(
            err,
            ParseError::InvalidValue {
                key: "width".into(),
                value: "wide".into()
            }
        );
    }

    #[test]
    fn negative_dimension_is_rejected() {
        assert!(matches!(
            parse("video/x-raw-rgb;height=(int)-2"),
            Err(ParseError::InvalidValue { .. })
        ));
    }

    #[test]
    fn repeated_sign_is_rejected() {
        for value in ["--4", "+-4", "-+4", "--9223372036854775808", "0x-4", "-"] {
            let descriptor = format!("video/x-raw-rgb;width=(int){}", value);
            assert_eq!(
                parse(&descriptor),
                Err(ParseError::InvalidValue {
                    key: "width".into(),
                    value: value.into()
                }),
                "{}",
                value
            );
        }
    }

    #[test]
    fn out_of_range_integer_is_rejected() {
        assert!(matches!(
            parse("video/x-raw-rgb;red_mask=(int)-9223372036854775809"),
            Err(ParseError::InvalidValue { .. })
        ));
        assert!(matches!(
            parse("video/x-raw-rgb;width=(int)4294967296"),
            Err(ParseError::InvalidValue { .. })
        ));
    }

    #[test]
    fn masks_accept_hex_and_signed_values() -> Result<(), ParseError> {
        let format = parse("video/x-raw-rgb;red_mask=(int)0xff0000;blue_mask=(int)-16777216")?;
        assert_eq!(format.red_mask, Some(0x00ff_0000));
        assert_eq!(format.blue_mask, Some(0xff00_0000));
        Ok(())
    }

    #[test]
    fn untyped_and_quoted_values() -> Result<(), ParseError> {
        let format = parse("video/x-raw-yuv;width=16;format=\"I420\"")?;
        assert_eq!(format.width, Some(16));
        assert_eq!(format.fourcc.as_deref(), Some("I420"));
        Ok(())
    }

    #[test]
    fn rule_compilation_failure_is_reported_once() {
        let err = CapsParser::from_rules([
            FieldRule::new("width", Field::Width),
            FieldRule::new("width", Field::Height),
        ])
        .unwrap_err();
        assert!(matches!(err, ParseError::InvalidRule { reason: "duplicate key", .. }));

        let err = CapsParser::from_rules([FieldRule::new("wid th", Field::Width)]).unwrap_err();
        assert!(matches!(err, ParseError::InvalidRule { .. }));
    }

    #[test]
    fn custom_rules_map_aliases() -> Result<(), ParseError> {
        let parser = CapsParser::from_rules([
            FieldRule::new("w", Field::Width),
            FieldRule::new("h", Field::Height),
        ])?;
        let format = parser.parse("video/x-raw-rgb;w=(int)3;h=(int)5;width=(int)9")?;
        assert_eq!(format.width, Some(3));
        assert_eq!(format.height, Some(5));
        Ok(())
    }
}
