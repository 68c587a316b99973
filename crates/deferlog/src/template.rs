//! printf-style deferred formatting.
//!
//! A [`TemplateFormatter`] payload is `(format string, argument tuple)`. The
//! grammar is `%[flags][width][.precision]<conversion>` with flags `-+ #0`,
//! conversions `d`, `x`, `X`, `f`, `g`, `s`, and `%%` for a literal percent.
//! A specifier that does not apply to its argument prints a single `%`, the
//! argument is consumed, and scanning continues — same recovery as stdio-free
//! printf clones.

use crate::error::FlushError;
use crate::frame::Formatter;
use crate::ntoa::{ftoa_base10_f, ftoa_base10_g, itoa_base10, itoa_base16, ConversionSpec, Integer};
use crate::output::OutputBuffer;

/// Formatter for `(&'static str, args)` payloads submitted by
/// [`Log::write`](crate::Log::write) and the severity façade.
pub struct TemplateFormatter;

impl<A: TemplateArgs> Formatter<(&'static str, A)> for TemplateFormatter {
    fn format(out: &mut OutputBuffer, payload: (&'static str, A)) -> Result<(), FlushError> {
        let (fmt, args) = payload;
        args.format_with(out, fmt)
    }
}

fn parse_number(bytes: &[u8], pos: &mut usize) -> usize {
    let mut value = 0usize;
    while let Some(digit) = bytes.get(*pos).filter(|b| b.is_ascii_digit()) {
        value = value * 10 + usize::from(digit - b'0');
        *pos += 1;
    }
    value
}

/// Consumes the flags, width and precision at the head of `fmt`, leaving the
/// conversion character.
fn parse_conversion_spec(fmt: &str) -> (ConversionSpec, &str) {
    let bytes = fmt.as_bytes();
    let mut spec = ConversionSpec::default();
    let mut show_plus_sign = false;
    let mut blank_sign = false;
    let mut pos = 0;
    while let Some(&flag) = bytes.get(pos) {
        match flag {
            b'-' => spec.left_justify = true,
            b'+' => show_plus_sign = true,
            b' ' => blank_sign = true,
            b'#' => spec.alternative_form = true,
            b'0' => spec.pad_with_zeroes = true,
            _ => break,
        }
        pos += 1;
    }

    spec.minimum_field_width = parse_number(bytes, &mut pos);
    if bytes.get(pos) == Some(&b'.') {
        pos += 1;
        spec.precision = if bytes.get(pos).is_some_and(u8::is_ascii_digit) {
            Some(parse_number(bytes, &mut pos))
        } else {
            None
        };
    }
    if show_plus_sign {
        spec.plus_sign = Some('+');
    } else if blank_sign {
        spec.plus_sign = Some(' ');
    }

    (spec, &fmt[pos..])
}

/// Copies literal text up to the next specifier, translating `%%`. Returns
/// the format string right after the `%`, or `None` at the end of input.
fn next_specifier<'f>(
    out: &mut OutputBuffer,
    mut fmt: &'f str,
) -> Result<Option<&'f str>, FlushError> {
    loop {
        match fmt.find('%') {
            None => {
                out.write_str(fmt)?;
                return Ok(None);
            }
            Some(idx) => {
                out.write_str(&fmt[..idx])?;
                fmt = &fmt[idx + 1..];
                if fmt.as_bytes().first() == Some(&b'%') {
                    out.write_byte(b'%')?;
                    fmt = &fmt[1..];
                } else {
                    return Ok(Some(fmt));
                }
            }
        }
    }
}

/// One argument of a template payload.
pub trait TemplateArg: Send + 'static {
    /// Renders `self` per the specifier at the head of `fmt` and returns the
    /// remaining format string, or `None` when the specifier does not apply
    /// to this argument type.
    fn format_arg<'f>(self, out: &mut OutputBuffer, fmt: &'f str)
        -> Result<Option<&'f str>, FlushError>;
}

fn format_int<'f, V: Integer>(
    out: &mut OutputBuffer,
    fmt: &'f str,
    value: V,
) -> Result<Option<&'f str>, FlushError> {
    let (mut spec, rest) = parse_conversion_spec(fmt);
    match rest.as_bytes().first().copied() {
        Some(b'd') => {
            itoa_base10(out, value, &spec)?;
            Ok(Some(&rest[1..]))
        }
        Some(b'x') => {
            itoa_base16(out, value, &spec)?;
            Ok(Some(&rest[1..]))
        }
        Some(b'X') => {
            spec.uppercase = true;
            itoa_base16(out, value, &spec)?;
            Ok(Some(&rest[1..]))
        }
        _ => Ok(None),
    }
}

fn format_float<'f>(
    out: &mut OutputBuffer,
    fmt: &'f str,
    value: f64,
) -> Result<Option<&'f str>, FlushError> {
    let (spec, rest) = parse_conversion_spec(fmt);
    match rest.as_bytes().first().copied() {
        Some(b'f') => {
            ftoa_base10_f(out, value, &spec)?;
            Ok(Some(&rest[1..]))
        }
        Some(b'g') => {
            ftoa_base10_g(out, value, &spec)?;
            Ok(Some(&rest[1..]))
        }
        _ => Ok(None),
    }
}

macro_rules! impl_template_arg_int {
    ($($t:ty),*) => {$(
        impl TemplateArg for $t {
            fn format_arg<'f>(
                self,
                out: &mut OutputBuffer,
                fmt: &'f str,
            ) -> Result<Option<&'f str>, FlushError> {
                format_int(out, fmt, self)
            }
        }
    )*};
}

impl_template_arg_int!(i8, u8, i16, u16, i32, u32, i64, u64, isize, usize);

impl TemplateArg for f64 {
    fn format_arg<'f>(
        self,
        out: &mut OutputBuffer,
        fmt: &'f str,
    ) -> Result<Option<&'f str>, FlushError> {
        format_float(out, fmt, self)
    }
}

impl TemplateArg for f32 {
    fn format_arg<'f>(
        self,
        out: &mut OutputBuffer,
        fmt: &'f str,
    ) -> Result<Option<&'f str>, FlushError> {
        format_float(out, fmt, f64::from(self))
    }
}

impl TemplateArg for char {
    fn format_arg<'f>(
        self,
        out: &mut OutputBuffer,
        fmt: &'f str,
    ) -> Result<Option<&'f str>, FlushError> {
        if fmt.as_bytes().first() == Some(&b's') {
            let mut utf8 = [0u8; 4];
            out.write_str(self.encode_utf8(&mut utf8))?;
            Ok(Some(&fmt[1..]))
        } else {
            format_int(out, fmt, u32::from(self))
        }
    }
}

impl TemplateArg for &'static str {
    fn format_arg<'f>(
        self,
        out: &mut OutputBuffer,
        fmt: &'f str,
    ) -> Result<Option<&'f str>, FlushError> {
        if fmt.as_bytes().first() == Some(&b's') {
            out.write_str(self)?;
            Ok(Some(&fmt[1..]))
        } else {
            Ok(None)
        }
    }
}

impl TemplateArg for String {
    fn format_arg<'f>(
        self,
        out: &mut OutputBuffer,
        fmt: &'f str,
    ) -> Result<Option<&'f str>, FlushError> {
        if fmt.as_bytes().first() == Some(&b's') {
            out.write_str(&self)?;
            Ok(Some(&fmt[1..]))
        } else {
            Ok(None)
        }
    }
}

impl TemplateArg for bool {
    fn format_arg<'f>(
        self,
        out: &mut OutputBuffer,
        fmt: &'f str,
    ) -> Result<Option<&'f str>, FlushError> {
        if fmt.as_bytes().first() == Some(&b's') {
            out.write_str(if self { "true" } else { "false" })?;
            Ok(Some(&fmt[1..]))
        } else {
            format_int(out, fmt, u32::from(self))
        }
    }
}

/// Argument tuple of a template payload; implemented for tuples of up to
/// eight [`TemplateArg`]s.
pub trait TemplateArgs: Send + 'static {
    fn format_with(self, out: &mut OutputBuffer, fmt: &'static str) -> Result<(), FlushError>;
}

fn format_remainder(out: &mut OutputBuffer, mut fmt: &str) -> Result<(), FlushError> {
    // No arguments left: remaining specifiers degrade to a literal '%' with
    // their body printed as ordinary text.
    while let Some(rest) = next_specifier(out, fmt)? {
        out.write_byte(b'%')?;
        fmt = rest;
    }
    Ok(())
}

impl TemplateArgs for () {
    fn format_with(self, out: &mut OutputBuffer, fmt: &'static str) -> Result<(), FlushError> {
        format_remainder(out, fmt)
    }
}

macro_rules! impl_template_args {
    ($($name:ident),+) => {
        impl<$($name: TemplateArg),+> TemplateArgs for ($($name,)+) {
            #[allow(non_snake_case)]
            fn format_with(
                self,
                out: &mut OutputBuffer,
                fmt: &'static str,
            ) -> Result<(), FlushError> {
                let ($($name,)+) = self;
                let mut fmt: &str = fmt;
                $(
                    let Some(spec_fmt) = next_specifier(out, fmt)? else {
                        return Ok(());
                    };
                    match $name.format_arg(out, spec_fmt)? {
                        Some(rest) => fmt = rest,
                        None => {
                            out.write_byte(b'%')?;
                            fmt = spec_fmt;
                        }
                    }
                )+
                format_remainder(out, fmt)
            }
        }
    };
}

impl_template_args!(A);
impl_template_args!(A, B);
impl_template_args!(A, B, C);
impl_template_args!(A, B, C, D);
impl_template_args!(A, B, C, D, E);
impl_template_args!(A, B, C, D, E, F);
impl_template_args!(A, B, C, D, E, F, G);
impl_template_args!(A, B, C, D, E, F, G, H);
