use std::fmt::{self, Write as _};

use nova_jdwp::JdwpValue;

use crate::context::ManagerContext;
use crate::error::{EvalResult, EvaluateError};
use crate::handle::EvaluationHandle;

/// Text for values that need no round-trip to the debuggee.
///
/// Returns `None` for object references.
pub fn render_locally(value: &JdwpValue) -> Option<String> {
    let text = match value {
        JdwpValue::Null => "null".to_owned(),
        JdwpValue::Void => "void".to_owned(),
        JdwpValue::Boolean(v) => v.to_string(),
        JdwpValue::Byte(v) => v.to_string(),
        JdwpValue::Short(v) => v.to_string(),
        JdwpValue::Int(v) => v.to_string(),
        JdwpValue::Long(v) => v.to_string(),
        JdwpValue::Float(v) => java_floating(*v),
        JdwpValue::Double(v) => java_floating(*v),
        JdwpValue::Char(c) => {
            let mut out = String::from("'");
            push_escaped(&mut out, *c, '\'');
            out.push('\'');
            out
        }
        JdwpValue::Object(_) => return None,
    };
    Some(text)
}

/// Formats like `Float.toString`/`Double.toString`: always a fraction digit,
/// `E` notation outside `[1e-3, 1e7)`.
/// Digits are the shortest round-trip form of `v`'s own type.
fn java_floating<F>(v: F) -> String
where
    F: Copy + Into<f64> + fmt::Display + fmt::LowerExp,
{
    let wide: f64 = v.into();
    if wide.is_nan() {
        return "NaN".to_owned();
    }
    if wide.is_infinite() {
        return if wide > 0.0 { "Infinity" } else { "-Infinity" }.to_owned();
    }
    let magnitude = wide.abs();
    if wide != 0.0 && !(1e-3..1e7).contains(&magnitude) {
        let formatted = format!("{v:e}");
        let (mantissa, exponent) = formatted.split_once('e').unwrap_or((formatted.as_str(), "0"));
        let mantissa = if mantissa.contains('.') {
            mantissa.to_owned()
        } else {
            format!("{mantissa}.0")
        };
        return format!("{mantissa}E{exponent}");
    }
    if wide.fract() == 0.0 {
        format!("{v:.1}")
    } else {
        v.to_string()
    }
}

/// Quote `value` as a Java string literal.
pub fn quote_java_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        push_escaped(&mut out, c, '"');
    }
    out.push('"');
    out
}

fn push_escaped(out: &mut String, c: char, quote: char) {
    match c {
        '\\' => out.push_str("\\\\"),
        '\n' => out.push_str("\\n"),
        '\r' => out.push_str("\\r"),
        '\t' => out.push_str("\\t"),
        '\u{8}' => out.push_str("\\b"),
        '\u{c}' => out.push_str("\\f"),
        c if c == quote => {
            out.push('\\');
            out.push(c);
        }
        c if c.is_control() => {
            let _ = write!(out, "\\u{:04x}", c as u32);
        }
        c => out.push(c),
    }
}

/// Render one value with its own round-trip(s).
///
/// Strings are read and quoted; other objects go through `toString()`, whose
/// `null` result is reported as `Ok(None)`.
pub(crate) fn render_individually(
    ctx: &mut ManagerContext,
    handle: &EvaluationHandle,
    value: &JdwpValue,
) -> EvalResult<Option<String>> {
    let object = match value {
        JdwpValue::Object(object) => object,
        other => return Ok(render_locally(other)),
    };
    handle.ensure_active()?;
    if object.is_string() {
        let text = ctx.client().string_value(object.id)?;
        return Ok(Some(quote_java_string(&text)));
    }

    let to_string = ctx.object_to_string()?;
    match ctx.invoke_method(handle, object, &to_string, &[])? {
        JdwpValue::Null => Ok(None),
        JdwpValue::Object(text) => Ok(Some(ctx.client().string_value(text.id)?)),
        other => Err(EvaluateError::Other(format!(
            "toString() returned a non-object value: {other:?}"
        ))),
    }
}
