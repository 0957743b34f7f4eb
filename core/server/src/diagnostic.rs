//! printf-style formatting for engine fatal messages.
//!
//! The engine reports fatal conditions as a C-style template plus arguments.
//! Messages are rendered into a small fixed buffer first; when the result does
//! not fit, the buffer is resized to the exact length reported by the first
//! pass and the message is rendered once more. Output is never truncated.
//!
//! Supported: `%d %i %u %x %X %o %c %s %f %F %e %E %%`, flags `- + 0 #` and
//! space, width, precision (`*` takes an integer argument), and the length
//! modifiers `h l ll z j t L`, which are accepted and ignored. Widths and `%s`
//! precision count bytes, as in C.

pub const INITIAL_BUFFER_SIZE: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum FormatArg {
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Char(char),
}

impl From<i32> for FormatArg {
    fn from(value: i32) -> Self {
        FormatArg::Int(value.into())
    }
}

impl From<i64> for FormatArg {
    fn from(value: i64) -> Self {
        FormatArg::Int(value)
    }
}

impl From<u32> for FormatArg {
    fn from(value: u32) -> Self {
        FormatArg::UInt(value.into())
    }
}

impl From<u64> for FormatArg {
    fn from(value: u64) -> Self {
        FormatArg::UInt(value)
    }
}

impl From<usize> for FormatArg {
    fn from(value: usize) -> Self {
        FormatArg::UInt(value as u64)
    }
}

impl From<f64> for FormatArg {
    fn from(value: f64) -> Self {
        FormatArg::Float(value)
    }
}

impl From<char> for FormatArg {
    fn from(value: char) -> Self {
        FormatArg::Char(value)
    }
}

impl From<&str> for FormatArg {
    fn from(value: &str) -> Self {
        FormatArg::Str(value.to_string())
    }
}

impl From<String> for FormatArg {
    fn from(value: String) -> Self {
        FormatArg::Str(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("format string ends inside a conversion at byte {0}")]
    Truncated(usize),

    #[error("unknown conversion `%{conversion}` at byte {offset}")]
    UnknownConversion { conversion: char, offset: usize },

    #[error("missing argument {index}")]
    MissingArgument { index: usize },

    #[error("argument {index} cannot be formatted with `%{conversion}`")]
    TypeMismatch { index: usize, conversion: char },

    #[error("formatted message is not valid UTF-8")]
    Encoding,
}

/// Formats `format` with `args`, growing the buffer at most once.
pub fn format_message(format: &str, args: &[FormatArg]) -> Result<String, FormatError> {
    let mut buffer = vec![0u8; INITIAL_BUFFER_SIZE];
    let mut length = format_into(&mut buffer, format, args)?;
    if length > buffer.len() {
        buffer.resize(length, 0);
        length = format_into(&mut buffer, format, args)?;
    }
    buffer.truncate(length);
    String::from_utf8(buffer).map_err(|_| FormatError::Encoding)
}

/// Writes as much of the message as fits into `out` and returns the full
/// length the message needs.
pub fn format_into(out: &mut [u8], format: &str, args: &[FormatArg]) -> Result<usize, FormatError> {
    let mut sink = BoundedSink { out, len: 0 };
    let mut args = ArgCursor { args, next: 0 };
    let bytes = format.as_bytes();
    let mut index = 0;
    let mut literal_start = 0;

    while index < bytes.len() {
        if bytes[index] != b'%' {
            index += 1;
            continue;
        }
        sink.push(&bytes[literal_start..index]);
        let (spec, next) = parse_spec(format, index, &mut args)?;
        render(&mut sink, &spec, &mut args)?;
        index = next;
        literal_start = next;
    }
    sink.push(&bytes[literal_start..]);

    Ok(sink.len)
}

struct BoundedSink<'a> {
    out: &'a mut [u8],
    len: usize,
}

impl BoundedSink<'_> {
    fn push(&mut self, bytes: &[u8]) {
        if self.len < self.out.len() {
            let room = self.out.len() - self.len;
            let take = room.min(bytes.len());
            self.out[self.len..self.len + take].copy_from_slice(&bytes[..take]);
        }
        self.len += bytes.len();
    }

    fn push_repeated(&mut self, byte: u8, count: usize) {
        for _ in 0..count {
            self.push(&[byte]);
        }
    }
}

struct ArgCursor<'a> {
    args: &'a [FormatArg],
    next: usize,
}

impl<'a> ArgCursor<'a> {
    fn take(&mut self) -> Result<(usize, &'a FormatArg), FormatError> {
        let index = self.next;
        let arg = self
            .args
            .get(index)
            .ok_or(FormatError::MissingArgument { index })?;
        self.next += 1;
        Ok((index, arg))
    }

    fn take_count(&mut self, conversion: char) -> Result<i64, FormatError> {
        match self.take()? {
            (_, FormatArg::Int(value)) => Ok(*value),
            (_, FormatArg::UInt(value)) => Ok(i64::try_from(*value).unwrap_or(i64::MAX)),
            (index, _) => Err(FormatError::TypeMismatch { index, conversion }),
        }
    }
}

#[derive(Debug, Default)]
struct Spec {
    left: bool,
    plus: bool,
    space: bool,
    zero: bool,
    alternate: bool,
    width: usize,
    precision: Option<usize>,
    conversion: char,
    offset: usize,
}

fn parse_spec(
    format: &str,
    start: usize,
    args: &mut ArgCursor<'_>,
) -> Result<(Spec, usize), FormatError> {
    let bytes = format.as_bytes();
    let mut spec = Spec {
        offset: start,
        ..Spec::default()
    };
    let mut index = start + 1;

    while let Some(&byte) = bytes.get(index) {
        match byte {
            b'-' => spec.left = true,
            b'+' => spec.plus = true,
            b' ' => spec.space = true,
            b'0' => spec.zero = true,
            b'#' => spec.alternate = true,
            _ => break,
        }
        index += 1;
    }

    if bytes.get(index) == Some(&b'*') {
        let width = args.take_count('*')?;
        if width < 0 {
            spec.left = true;
        }
        spec.width = width.unsigned_abs() as usize;
        index += 1;
    } else {
        let (width, next) = parse_number(bytes, index);
        spec.width = width;
        index = next;
    }

    if bytes.get(index) == Some(&b'.') {
        index += 1;
        if bytes.get(index) == Some(&b'*') {
            let precision = args.take_count('*')?;
            spec.precision = usize::try_from(precision).ok();
            index += 1;
        } else {
            let (precision, next) = parse_number(bytes, index);
            spec.precision = Some(precision);
            index = next;
        }
    }

    while let Some(&byte) = bytes.get(index) {
        if matches!(byte, b'h' | b'l' | b'z' | b'j' | b't' | b'L') {
            index += 1;
        } else {
            break;
        }
    }

    let conversion = format[index.min(format.len())..]
        .chars()
        .next()
        .ok_or(FormatError::Truncated(start))?;
    spec.conversion = conversion;
    Ok((spec, index + conversion.len_utf8()))
}

fn parse_number(bytes: &[u8], mut index: usize) -> (usize, usize) {
    let mut value: usize = 0;
    while let Some(digit) = bytes.get(index).filter(|byte| byte.is_ascii_digit()) {
        value = value.saturating_mul(10).saturating_add((digit - b'0') as usize);
        index += 1;
    }
    (value, index)
}

fn render(sink: &mut BoundedSink<'_>, spec: &Spec, args: &mut ArgCursor<'_>) -> Result<(), FormatError> {
    match spec.conversion {
        '%' => sink.push(b"%"),
        'd' | 'i' => {
            let value = match args.take()? {
                (_, FormatArg::Int(value)) => i128::from(*value),
                (_, FormatArg::UInt(value)) => i128::from(*value),
                (index, _) => return Err(mismatch(index, spec)),
            };
            let sign = if value < 0 {
                "-"
            } else if spec.plus {
                "+"
            } else if spec.space {
                " "
            } else {
                ""
            };
            let digits = with_min_digits(value.unsigned_abs().to_string(), spec.precision);
            pad_numeric(sink, spec, sign, &digits);
        }
        'u' | 'x' | 'X' | 'o' => {
            let value = match args.take()? {
                (_, FormatArg::Int(value)) => *value as u64,
                (_, FormatArg::UInt(value)) => *value,
                (index, _) => return Err(mismatch(index, spec)),
            };
            let (prefix, digits) = match spec.conversion {
                'x' => (if spec.alternate && value != 0 { "0x" } else { "" }, format!("{:x}", value)),
                'X' => (if spec.alternate && value != 0 { "0X" } else { "" }, format!("{:X}", value)),
                'o' => (if spec.alternate && value != 0 { "0" } else { "" }, format!("{:o}", value)),
                _ => ("", value.to_string()),
            };
            pad_numeric(sink, spec, prefix, &with_min_digits(digits, spec.precision));
        }
        'c' => {
            let value = match args.take()? {
                (_, FormatArg::Char(value)) => *value,
                (index, FormatArg::Int(value)) => u32::try_from(*value)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| mismatch(index, spec))?,
                (index, FormatArg::UInt(value)) => u32::try_from(*value)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| mismatch(index, spec))?,
                (index, _) => return Err(mismatch(index, spec)),
            };
            pad_text(sink, spec, value.encode_utf8(&mut [0u8; 4]));
        }
        's' => {
            let (index, arg) = args.take()?;
            let text = match arg {
                FormatArg::Str(value) => value.clone(),
                FormatArg::Char(value) => value.to_string(),
                _ => return Err(mismatch(index, spec)),
            };
            // Precision counts bytes; a cut never splits a character.
            let text = match spec.precision {
                Some(limit) if limit < text.len() => {
                    let mut end = limit;
                    while !text.is_char_boundary(end) {
                        end -= 1;
                    }
                    &text[..end]
                }
                _ => text.as_str(),
            };
            pad_text(sink, spec, text);
        }
        'f' | 'F' | 'e' | 'E' => {
            let value = match args.take()? {
                (_, FormatArg::Float(value)) => *value,
                (index, _) => return Err(mismatch(index, spec)),
            };
            let sign = if value.is_sign_negative() && !value.is_nan() {
                "-"
            } else if spec.plus {
                "+"
            } else if spec.space {
                " "
            } else {
                ""
            };
            let magnitude = value.abs();
            let precision = spec.precision.unwrap_or(6);
            let body = if !magnitude.is_finite() {
                let text = if magnitude.is_nan() { "nan" } else { "inf" };
                if spec.conversion.is_ascii_uppercase() {
                    text.to_ascii_uppercase()
                } else {
                    text.to_string()
                }
            } else if matches!(spec.conversion, 'e' | 'E') {
                c_exponent(magnitude, precision, spec.conversion == 'E')
            } else {
                format!("{:.*}", precision, magnitude)
            };
            if magnitude.is_finite() {
                pad_numeric(sink, spec, sign, &body);
            } else {
                pad_text(sink, spec, &format!("{}{}", sign, body));
            }
        }
        other => {
            return Err(FormatError::UnknownConversion {
                conversion: other,
                offset: spec.offset,
            })
        }
    }
    Ok(())
}

fn mismatch(index: usize, spec: &Spec) -> FormatError {
    FormatError::TypeMismatch {
        index,
        conversion: spec.conversion,
    }
}

fn with_min_digits(digits: String, precision: Option<usize>) -> String {
    match precision {
        Some(0) if digits == "0" => String::new(),
        Some(min) if digits.len() < min => format!("{}{}", "0".repeat(min - digits.len()), digits),
        _ => digits,
    }
}

fn c_exponent(value: f64, precision: usize, upper: bool) -> String {
    let rendered = format!("{:.*e}", precision, value);
    let (mantissa, exponent) = rendered.split_once('e').unwrap_or((rendered.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let sign = if exponent < 0 { '-' } else { '+' };
    let marker = if upper { 'E' } else { 'e' };
    format!("{}{}{}{:02}", mantissa, marker, sign, exponent.unsigned_abs())
}

fn pad_numeric(sink: &mut BoundedSink<'_>, spec: &Spec, prefix: &str, digits: &str) {
    let len = prefix.len() + digits.len();
    let fill = spec.width.saturating_sub(len);
    let zero_fill = spec.zero && !spec.left && (spec.precision.is_none() || is_float(spec));

    if spec.left {
        sink.push(prefix.as_bytes());
        sink.push(digits.as_bytes());
        sink.push_repeated(b' ', fill);
    } else if zero_fill {
        sink.push(prefix.as_bytes());
        sink.push_repeated(b'0', fill);
        sink.push(digits.as_bytes());
    } else {
        sink.push_repeated(b' ', fill);
        sink.push(prefix.as_bytes());
        sink.push(digits.as_bytes());
    }
}

fn pad_text(sink: &mut BoundedSink<'_>, spec: &Spec, text: &str) {
    let fill = spec.width.saturating_sub(text.len());
    if spec.left {
        sink.push(text.as_bytes());
        sink.push_repeated(b' ', fill);
    } else {
        sink.push_repeated(b' ', fill);
        sink.push(text.as_bytes());
    }
}

fn is_float(spec: &Spec) -> bool {
    matches!(spec.conversion, 'f' | 'F' | 'e' | 'E')
}
