//! Property-based round-trip tests for the conversion layer, driven through
//! the full producer/consumer pipeline.

use deferlog::{
    ftoa_base10_f, ftoa_base10_g, itoa_base10, ConversionSpec, FlushError, Formatter, Log,
    OutputBuffer, WriteError, Writer,
};
use proptest::prelude::*;
use std::sync::{Arc, Mutex};

struct VecWriter(Arc<Mutex<Vec<u8>>>);

impl Writer for VecWriter {
    fn write(&mut self, bytes: &[u8]) -> Result<usize, WriteError> {
        self.0.lock().unwrap().extend_from_slice(bytes);
        Ok(bytes.len())
    }
}

/// Formatter whose payload is the formatting closure itself; lets a test
/// submit arbitrary conversion calls as records.
struct Apply;

impl<P> Formatter<P> for Apply
where
    P: FnOnce(&mut OutputBuffer) -> Result<(), FlushError> + Send + 'static,
{
    fn format(out: &mut OutputBuffer, payload: P) -> Result<(), FlushError> {
        payload(out)
    }
}

/// Runs one closure per input value through a log and returns one output
/// line per value.
fn render_lines<T, F>(values: Vec<T>, convert: F) -> Vec<String>
where
    T: Send + 'static + Copy,
    F: Fn(&mut OutputBuffer, T) -> Result<(), FlushError> + Send + Copy + 'static,
{
    let sink = Arc::new(Mutex::new(Vec::new()));
    let log = Log::open(Box::new(VecWriter(Arc::clone(&sink)))).unwrap();
    let count = values.len();
    for value in values {
        log.write::<Apply, _>(move |out: &mut OutputBuffer| {
            convert(out, value)?;
            out.write_byte(b'\n')
        })
        .unwrap();
    }
    log.close().unwrap();

    let sink = sink.lock().unwrap();
    let text = String::from_utf8(sink.clone()).unwrap();
    let lines: Vec<String> = text.lines().map(str::to_owned).collect();
    assert_eq!(lines.len(), count);
    lines
}

proptest! {
    /// itoa_base10 with the default spec matches the standard formatter for
    /// every signed value.
    #[test]
    fn prop_itoa_signed_round_trip(values in prop::collection::vec(any::<i64>(), 1..64)) {
        let lines = render_lines(values.clone(), |out, v| {
            itoa_base10(out, v, &ConversionSpec::default())
        });
        for (value, line) in values.iter().zip(&lines) {
            prop_assert_eq!(line.parse::<i64>().unwrap(), *value);
            prop_assert_eq!(line, &value.to_string());
        }
    }

    /// Same for the full unsigned range.
    #[test]
    fn prop_itoa_unsigned_round_trip(values in prop::collection::vec(any::<u64>(), 1..64)) {
        let lines = render_lines(values.clone(), |out, v| {
            itoa_base10(out, v, &ConversionSpec::default())
        });
        for (value, line) in values.iter().zip(&lines) {
            prop_assert_eq!(line.parse::<u64>().unwrap(), *value);
        }
    }

    /// %g with 17 significant digits reproduces every finite binary64
    /// exactly after parsing.
    #[test]
    fn prop_ftoa_g17_round_trips_exactly(
        values in prop::collection::vec(
            any::<f64>().prop_filter("finite", |v| v.is_finite()),
            1..64,
        )
    ) {
        let spec = ConversionSpec {
            precision: Some(17),
            ..ConversionSpec::default()
        };
        let lines = render_lines(values.clone(), move |out, v| ftoa_base10_g(out, v, &spec));
        for (value, line) in values.iter().zip(&lines) {
            let parsed: f64 = line.parse().unwrap();
            prop_assert_eq!(
                parsed.to_bits(),
                value.to_bits(),
                "{} did not round-trip {}",
                line,
                value
            );
        }
    }

    /// %f emits exactly the requested number of fractional digits, and the
    /// dot only when there are fractional digits (or alternative form).
    #[test]
    fn prop_ftoa_f_fractional_digit_count(
        value in any::<f64>().prop_filter("finite", |v| v.is_finite()),
        precision in 0usize..12,
    ) {
        let spec = ConversionSpec {
            precision: Some(precision),
            ..ConversionSpec::default()
        };
        let lines = render_lines(vec![value], move |out, v| ftoa_base10_f(out, v, &spec));
        let line = &lines[0];
        match line.find('.') {
            Some(idx) => {
                prop_assert_eq!(line.len() - idx - 1, precision, "in {}", line);
            }
            None => prop_assert_eq!(precision, 0, "missing dot in {}", line),
        }
    }

    /// Width and justification hold for integers: at least the field width,
    /// padding on the requested side.
    #[test]
    fn prop_itoa_field_width(value in any::<i32>(), width in 0usize..24, left in any::<bool>()) {
        let spec = ConversionSpec {
            minimum_field_width: width,
            left_justify: left,
            ..ConversionSpec::default()
        };
        let lines = render_lines(vec![value], move |out, v| itoa_base10(out, v, &spec));
        let line = &lines[0];
        prop_assert!(line.len() >= width);
        prop_assert_eq!(line.trim(), value.to_string());
        if line.len() > value.to_string().len() {
            if left {
                prop_assert!(line.ends_with(' '));
            } else {
                prop_assert!(line.starts_with(' '));
            }
        }
    }
}
