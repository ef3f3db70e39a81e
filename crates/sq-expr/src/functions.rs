//! The callable allow-list and its implementations.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::Rng;
use rand::rngs::StdRng;
use sq_columnar::Column;
use sq_groupby::reduce;
use sq_types::{NullKind, Scalar, TypeError};

use crate::ExprError;

static MISSING: Scalar = Scalar::Null(NullKind::Null);

/// Evaluated operand: a literal stays scalar until it meets a column.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Value {
    Scalar(Scalar),
    Column(Column),
}

impl Value {
    pub(crate) fn is_scalar(&self) -> bool {
        matches!(self, Self::Scalar(_))
    }

    pub(crate) fn cell(&self, row: usize) -> &Scalar {
        match self {
            Self::Scalar(value) => value,
            Self::Column(column) => column.value(row).unwrap_or(&MISSING),
        }
    }

    pub(crate) fn into_column(self, len: usize) -> Column {
        match self {
            Self::Column(column) => column,
            Self::Scalar(value) => Column::full(value, len),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    If,
    Case,
    ToNumber,
    ToString,
    Lower,
    Upper,
    Trim,
    LTrim,
    RTrim,
    Round,
    Concat,
    Coalesce,
    IsNull,
    IsNotNull,
    Base64Encode,
    Base64Decode,
    Avg,
    Randomize,
    Min,
    Max,
    Sum,
    Median,
    Mode,
    Sqrt,
    DCount,
    Range,
    Abs,
    Len,
}

/// Every name an expression may call. Nothing outside this table runs.
pub const ALLOWED_FUNCTIONS: &[(&str, Function)] = &[
    ("if_", Function::If),
    ("case", Function::Case),
    ("tonumber", Function::ToNumber),
    ("tostring", Function::ToString),
    ("lower", Function::Lower),
    ("upper", Function::Upper),
    ("trim", Function::Trim),
    ("ltrim", Function::LTrim),
    ("rtrim", Function::RTrim),
    ("round", Function::Round),
    ("concat", Function::Concat),
    ("coalesce", Function::Coalesce),
    ("isnull", Function::IsNull),
    ("isnotnull", Function::IsNotNull),
    ("base64_encode", Function::Base64Encode),
    ("base64_decode", Function::Base64Decode),
    ("avg", Function::Avg),
    ("randomize", Function::Randomize),
    ("min", Function::Min),
    ("max", Function::Max),
    ("sum", Function::Sum),
    ("median", Function::Median),
    ("mode", Function::Mode),
    ("sqrt", Function::Sqrt),
    ("dcount", Function::DCount),
    ("range", Function::Range),
    ("abs", Function::Abs),
    ("len", Function::Len),
];

#[must_use]
pub fn is_allowed_function(name: &str) -> bool {
    Function::lookup(name).is_some()
}

impl Function {
    /// Exact-name lookup; callee names are case-sensitive.
    #[must_use]
    pub fn lookup(name: &str) -> Option<Self> {
        ALLOWED_FUNCTIONS
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, function)| *function)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        ALLOWED_FUNCTIONS
            .iter()
            .find(|(_, function)| *function == self)
            .map_or("?", |(name, _)| *name)
    }

    fn arity(self) -> (usize, Option<usize>, &'static str) {
        match self {
            Self::If => (3, Some(3), "exactly 3"),
            Self::Case => (2, None, "at least 2"),
            Self::ToNumber => (1, Some(2), "1 or 2"),
            Self::Trim | Self::LTrim | Self::RTrim | Self::Round => (1, Some(2), "1 or 2"),
            Self::ToString
            | Self::Lower
            | Self::Upper
            | Self::IsNull
            | Self::IsNotNull
            | Self::Base64Encode
            | Self::Base64Decode
            | Self::Randomize
            | Self::Sqrt
            | Self::Abs
            | Self::Len => (1, Some(1), "exactly 1"),
            Self::Concat
            | Self::Coalesce
            | Self::Avg
            | Self::Min
            | Self::Max
            | Self::Sum
            | Self::Median
            | Self::Mode
            | Self::DCount
            | Self::Range => (1, None, "at least 1"),
        }
    }

    fn keyword(self) -> Option<&'static str> {
        match self {
            Self::Round => Some("precision"),
            Self::Trim | Self::LTrim | Self::RTrim => Some("chars"),
            _ => None,
        }
    }
}

pub(crate) fn call(
    function: Function,
    mut args: Vec<Value>,
    keywords: Vec<(String, Value)>,
    len: usize,
    rng: &mut StdRng,
) -> Result<Value, ExprError> {
    for (keyword, value) in keywords {
        if function.keyword() != Some(keyword.as_str()) {
            return Err(ExprError::UnexpectedKeyword {
                function: function.name(),
                keyword,
            });
        }
        args.push(value);
    }

    let (min, max, expected) = function.arity();
    if args.len() < min || max.is_some_and(|max| args.len() > max) {
        return Err(ExprError::Arity {
            function: function.name(),
            expected,
            got: args.len(),
        });
    }

    match function {
        Function::If => row_wise(&args, len, |c| {
            Ok(if c[0].is_truthy() {
                c[1].clone()
            } else {
                c[2].clone()
            })
        }),
        Function::Case => row_wise(&args, len, |c| Ok(case_row(c))),
        Function::ToNumber => row_wise(&args, len, |c| {
            let base = match c.get(1) {
                Some(base) => Some(integer_argument(function, base)?),
                None => None,
            };
            to_number(c[0], base)
        }),
        Function::ToString => map_elements(&args[0], len, |v| Ok(Scalar::Utf8(v.render()))),
        Function::Lower => map_elements(&args[0], len, |v| Ok(Scalar::Utf8(v.render().to_lowercase()))),
        Function::Upper => map_elements(&args[0], len, |v| Ok(Scalar::Utf8(v.render().to_uppercase()))),
        Function::Trim | Function::LTrim | Function::RTrim => row_wise(&args, len, |c| {
            let chars = c.get(1).map(|chars| chars.render());
            Ok(trim_value(c[0], function, chars.as_deref()))
        }),
        Function::Round => row_wise(&args, len, |c| {
            let precision = match c.get(1) {
                Some(p) => i32::try_from(integer_argument(function, p)?).map_err(|_| {
                    ExprError::InvalidArgument {
                        function: function.name(),
                        message: "precision out of range".to_owned(),
                    }
                })?,
                None => 0,
            };
            round_value(c[0], precision)
        }),
        Function::Concat => row_wise(&args, len, |c| {
            Ok(Scalar::Utf8(c.iter().map(|v| v.render()).collect()))
        }),
        Function::Coalesce => row_wise(&args, len, |c| {
            Ok(c.iter()
                .find(|v| !v.is_missing())
                .map_or_else(Scalar::null, |v| (*v).clone()))
        }),
        Function::IsNull => row_wise(&args, len, |c| Ok(Scalar::Bool(c[0].is_missing()))),
        Function::IsNotNull => row_wise(&args, len, |c| Ok(Scalar::Bool(!c[0].is_missing()))),
        Function::Base64Encode => row_wise(&args, len, |c| {
            Ok(if c[0].is_missing() {
                Scalar::null()
            } else {
                Scalar::Utf8(STANDARD.encode(c[0].render()))
            })
        }),
        Function::Base64Decode => row_wise(&args, len, |c| base64_decode(c[0])),
        Function::Randomize => map_elements(&args[0], len, |v| randomize(v, rng)),
        Function::Sqrt => map_elements(&args[0], len, |v| {
            Ok(Scalar::Float64(numeric_argument(function, v)?.sqrt()))
        }),
        Function::Abs => map_elements(&args[0], len, |v| match v {
            Scalar::Int64(i) => Ok(i
                .checked_abs()
                .map_or(Scalar::Float64((*i as f64).abs()), Scalar::Int64)),
            other => Ok(Scalar::Float64(numeric_argument(function, other)?.abs())),
        }),
        Function::Len => row_wise(&args, len, |c| {
            Ok(match c[0] {
                v if v.is_missing() => Scalar::null(),
                Scalar::List(items) => Scalar::Int64(items.len() as i64),
                other => Scalar::Int64(other.render().chars().count() as i64),
            })
        }),
        Function::Avg
        | Function::Min
        | Function::Max
        | Function::Sum
        | Function::Median
        | Function::Mode
        | Function::DCount
        | Function::Range => row_wise(&args, len, |c| {
            let mut flat = Vec::new();
            for value in c {
                flatten_into(value, &mut flat);
            }
            let reduced = match function {
                Function::Avg => reduce::mean(&flat)?,
                Function::Min => reduce::min(&flat),
                Function::Max => reduce::max(&flat),
                Function::Sum => reduce::sum(&flat)?,
                Function::Median => reduce::median(&flat)?,
                Function::Mode => reduce::mode(&flat),
                Function::DCount => reduce::dcount(&flat),
                _ => reduce::range(&flat)?,
            };
            Ok(reduced)
        }),
    }
}

/// Runs `f` once per row over the argument cells. All-scalar arguments are
/// evaluated once and stay scalar.
fn row_wise<F>(args: &[Value], len: usize, mut f: F) -> Result<Value, ExprError>
where
    F: FnMut(&[&Scalar]) -> Result<Scalar, ExprError>,
{
    if args.iter().all(Value::is_scalar) {
        let cells = args.iter().map(|arg| arg.cell(0)).collect::<Vec<_>>();
        return Ok(Value::Scalar(f(&cells)?));
    }
    let mut out = Vec::with_capacity(len);
    let mut cells = Vec::with_capacity(args.len());
    for row in 0..len {
        cells.clear();
        cells.extend(args.iter().map(|arg| arg.cell(row)));
        out.push(f(&cells)?);
    }
    Ok(Value::Column(Column::from_values_lossy(out)))
}

/// Element-wise map that recurses into list cells and passes missing
/// values through untouched.
fn map_elements<F>(arg: &Value, len: usize, mut f: F) -> Result<Value, ExprError>
where
    F: FnMut(&Scalar) -> Result<Scalar, ExprError>,
{
    row_wise(std::slice::from_ref(arg), len, |c| map_nested(c[0], &mut f))
}

fn map_nested<F>(value: &Scalar, f: &mut F) -> Result<Scalar, ExprError>
where
    F: FnMut(&Scalar) -> Result<Scalar, ExprError>,
{
    match value {
        v if v.is_missing() => Ok(Scalar::null()),
        Scalar::List(items) => Ok(Scalar::List(
            items
                .iter()
                .map(|item| map_nested(item, f))
                .collect::<Result<Vec<_>, _>>()?,
        )),
        other => f(other),
    }
}

fn flatten_into<'a>(value: &'a Scalar, out: &mut Vec<&'a Scalar>) {
    match value {
        Scalar::List(items) => {
            for item in items {
                flatten_into(item, out);
            }
        }
        other => out.push(other),
    }
}

fn case_row(cells: &[&Scalar]) -> Scalar {
    let (pairs, default) = if cells.len() % 2 == 1 {
        (&cells[..cells.len() - 1], Some(cells[cells.len() - 1]))
    } else {
        (cells, None)
    };
    pairs
        .chunks(2)
        .find(|pair| pair[0].is_truthy())
        .map(|pair| pair[1])
        .or(default)
        .map_or_else(Scalar::null, Clone::clone)
}

fn integer_argument(function: Function, value: &Scalar) -> Result<i64, ExprError> {
    match value {
        Scalar::Int64(v) => Ok(*v),
        Scalar::Float64(v) if v.fract() == 0.0 => Ok(*v as i64),
        other => Err(ExprError::InvalidArgument {
            function: function.name(),
            message: format!("expected an integer, got {:?}", other.render()),
        }),
    }
}

fn numeric_argument(function: Function, value: &Scalar) -> Result<f64, ExprError> {
    value
        .numeric_value()
        .ok_or_else(|| ExprError::InvalidArgument {
            function: function.name(),
            message: format!("expected a number, got {:?}", value.render()),
        })
}

fn to_number(value: &Scalar, base: Option<i64>) -> Result<Scalar, ExprError> {
    match value {
        v if v.is_missing() => Ok(Scalar::null()),
        Scalar::Int64(_) | Scalar::Float64(_) => Ok(value.clone()),
        Scalar::Bool(v) => Ok(Scalar::Int64(i64::from(*v))),
        Scalar::Datetime(ms) => Ok(Scalar::Int64(*ms)),
        Scalar::Utf8(text) => {
            let parsed = match base {
                Some(base) if base != 10 => u32::try_from(base)
                    .ok()
                    .filter(|b| (2..=36).contains(b))
                    .and_then(|b| i64::from_str_radix(text.trim(), b).ok())
                    .map(Scalar::Int64),
                _ => match Scalar::infer_from_text(text) {
                    number @ (Scalar::Int64(_) | Scalar::Float64(_)) => Some(number),
                    _ => None,
                },
            };
            parsed.ok_or_else(|| {
                ExprError::Type(TypeError::InvalidNumber {
                    value: text.clone(),
                })
            })
        }
        Scalar::List(items) => Ok(Scalar::List(
            items
                .iter()
                .map(|item| to_number(item, base))
                .collect::<Result<Vec<_>, _>>()?,
        )),
        Scalar::Null(_) => Ok(Scalar::null()),
    }
}

fn trim_value(value: &Scalar, function: Function, chars: Option<&str>) -> Scalar {
    match value {
        v if v.is_missing() => Scalar::null(),
        Scalar::List(items) => Scalar::List(
            items
                .iter()
                .map(|item| trim_value(item, function, chars))
                .collect(),
        ),
        other => {
            let text = other.render();
            let matches = |c: char| match chars {
                Some(set) => set.contains(c),
                None => c.is_whitespace(),
            };
            let trimmed = match function {
                Function::LTrim => text.trim_start_matches(matches),
                Function::RTrim => text.trim_end_matches(matches),
                _ => text.trim_matches(matches),
            };
            Scalar::Utf8(trimmed.to_owned())
        }
    }
}

fn round_value(value: &Scalar, precision: i32) -> Result<Scalar, ExprError> {
    match value {
        v if v.is_missing() => Ok(Scalar::null()),
        Scalar::List(items) => Ok(Scalar::List(
            items
                .iter()
                .map(|item| round_value(item, precision))
                .collect::<Result<Vec<_>, _>>()?,
        )),
        Scalar::Int64(v) if precision >= 0 => Ok(Scalar::Int64(*v)),
        Scalar::Int64(v) => {
            let rounded = round_to(*v as f64, precision);
            Ok(Scalar::Int64(rounded as i64))
        }
        Scalar::Bool(v) => Ok(Scalar::Int64(i64::from(*v))),
        other => Ok(Scalar::Float64(round_to(
            numeric_argument(Function::Round, other)?,
            precision,
        ))),
    }
}

/// Round half to even at `precision` decimal places.
fn round_to(value: f64, precision: i32) -> f64 {
    let factor = 10_f64.powi(precision);
    if !factor.is_finite() || factor == 0.0 {
        return value;
    }
    (value * factor).round_ties_even() / factor
}

fn base64_decode(value: &Scalar) -> Result<Scalar, ExprError> {
    if value.is_missing() {
        return Ok(Scalar::null());
    }
    let invalid = |message: String| ExprError::InvalidArgument {
        function: Function::Base64Decode.name(),
        message,
    };
    let bytes = STANDARD
        .decode(value.render().trim())
        .map_err(|err| invalid(err.to_string()))?;
    String::from_utf8(bytes)
        .map(Scalar::Utf8)
        .map_err(|err| invalid(err.to_string()))
}

/// Decimal places written in a number's text form (`2.50` has 2).
fn decimal_places(text: &str) -> i32 {
    text.split_once('.')
        .map_or(0, |(_, frac)| frac.chars().take_while(char::is_ascii_digit).count() as i32)
}

/// Uniform draw from `[-|x|, |x|]` at the precision `x` was written with.
fn randomize(value: &Scalar, rng: &mut StdRng) -> Result<Scalar, ExprError> {
    let (magnitude, places, integral) = match value {
        Scalar::Int64(v) => {
            let Some(bound) = v.checked_abs() else {
                return Err(ExprError::InvalidArgument {
                    function: Function::Randomize.name(),
                    message: format!("{v} is out of range"),
                });
            };
            return Ok(Scalar::Int64(rng.random_range(-bound..=bound)));
        }
        Scalar::Float64(v) => (v.abs(), decimal_places(&v.to_string()), false),
        Scalar::Utf8(text) => match Scalar::infer_from_text(text) {
            Scalar::Int64(v) => (v.unsigned_abs() as f64, 0, true),
            Scalar::Float64(v) => (v.abs(), decimal_places(text), false),
            _ => {
                return Err(ExprError::InvalidArgument {
                    function: Function::Randomize.name(),
                    message: format!("expected a number, got {text:?}"),
                });
            }
        },
        other => {
            return Err(ExprError::InvalidArgument {
                function: Function::Randomize.name(),
                message: format!("expected a number, got {:?}", other.render()),
            });
        }
    };
    if !magnitude.is_finite() || magnitude > f64::MAX / 2.0 {
        return Err(ExprError::InvalidArgument {
            function: Function::Randomize.name(),
            message: format!("{magnitude} is out of range"),
        });
    }
    let drawn = round_to(rng.random_range(-magnitude..=magnitude), places);
    Ok(if integral {
        Scalar::Int64(drawn as i64)
    } else {
        Scalar::Float64(drawn)
    })
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use sq_columnar::Column;
    use sq_types::Scalar;

    use super::{Function, Value, call, decimal_places, is_allowed_function};
    use crate::ExprError;

    fn column(values: Vec<Scalar>) -> Value {
        Value::Column(Column::from_values_lossy(values))
    }

    fn run(function: Function, args: Vec<Value>, len: usize) -> Result<Value, ExprError> {
        let mut rng = StdRng::seed_from_u64(7);
        call(function, args, Vec::new(), len, &mut rng)
    }

    #[test]
    fn allow_list_is_exact() {
        assert!(is_allowed_function("if_"));
        assert!(is_allowed_function("base64_decode"));
        assert!(!is_allowed_function("if"));
        assert!(!is_allowed_function("__import__"));
        assert!(!is_allowed_function("eval"));
        assert_eq!(Function::lookup("round").map(Function::name), Some("round"));
    }

    #[test]
    fn arity_is_checked() {
        let err = run(Function::If, vec![Value::Scalar(Scalar::Bool(true))], 1)
            .expect_err("if_ needs three arguments");
        assert!(matches!(err, ExprError::Arity { function: "if_", got: 1, .. }));
    }

    #[test]
    fn case_without_default_yields_missing() {
        let out = run(
            Function::Case,
            vec![
                column(vec![Scalar::Bool(false), Scalar::Bool(true)]),
                Value::Scalar(Scalar::Utf8("yes".to_owned())),
            ],
            2,
        )
        .expect("case");
        let Value::Column(col) = out else {
            panic!("expected column");
        };
        assert_eq!(col.values(), &[Scalar::null(), Scalar::Utf8("yes".to_owned())]);
    }

    #[test]
    fn round_recurses_into_lists_and_keeps_ints() {
        let out = run(
            Function::Round,
            vec![
                Value::Scalar(Scalar::List(vec![
                    Scalar::Float64(1.256),
                    Scalar::Int64(3),
                ])),
                Value::Scalar(Scalar::Int64(2)),
            ],
            1,
        )
        .expect("round");
        assert_eq!(
            out,
            Value::Scalar(Scalar::List(vec![Scalar::Float64(1.26), Scalar::Int64(3)]))
        );
    }

    #[test]
    fn tonumber_rejects_text() {
        let err = run(
            Function::ToNumber,
            vec![Value::Scalar(Scalar::Utf8("abc".to_owned()))],
            1,
        )
        .expect_err("not a number");
        assert!(matches!(err, ExprError::Type(_)));
        let hex = run(
            Function::ToNumber,
            vec![
                Value::Scalar(Scalar::Utf8("ff".to_owned())),
                Value::Scalar(Scalar::Int64(16)),
            ],
            1,
        )
        .expect("hex");
        assert_eq!(hex, Value::Scalar(Scalar::Int64(255)));
    }

    #[test]
    fn row_wise_aggregates_flatten_lists() {
        let out = run(
            Function::Max,
            vec![
                Value::Scalar(Scalar::List(vec![Scalar::Int64(4), Scalar::Int64(9)])),
                Value::Scalar(Scalar::Int64(7)),
            ],
            1,
        )
        .expect("max");
        assert_eq!(out, Value::Scalar(Scalar::Int64(9)));

        let out = run(
            Function::Avg,
            vec![Value::Scalar(Scalar::Int64(1)), Value::Scalar(Scalar::Int64(2))],
            1,
        )
        .expect("avg");
        assert_eq!(out, Value::Scalar(Scalar::Float64(1.5)));
    }

    #[test]
    fn randomize_stays_in_bounds_at_literal_precision() {
        for _ in 0..20 {
            let Value::Scalar(Scalar::Float64(v)) = run(
                Function::Randomize,
                vec![Value::Scalar(Scalar::Float64(2.5))],
                1,
            )
            .expect("randomize") else {
                panic!("expected float");
            };
            assert!((-2.5..=2.5).contains(&v));
            assert_eq!((v * 10.0).round(), v * 10.0);
        }
        assert_eq!(decimal_places("2.50"), 2);
        assert_eq!(decimal_places("7"), 0);
    }

    #[test]
    fn base64_round_trips_and_rejects_garbage() {
        let encoded = run(
            Function::Base64Encode,
            vec![Value::Scalar(Scalar::Utf8("hi".to_owned()))],
            1,
        )
        .expect("encode");
        assert_eq!(encoded, Value::Scalar(Scalar::Utf8("aGk=".to_owned())));
        let err = run(
            Function::Base64Decode,
            vec![Value::Scalar(Scalar::Utf8("%%%".to_owned()))],
            1,
        )
        .expect_err("invalid base64");
        assert!(matches!(err, ExprError::InvalidArgument { .. }));
    }

    #[test]
    fn trim_accepts_character_set() {
        let out = run(
            Function::Trim,
            vec![
                Value::Scalar(Scalar::Utf8("xxhixx".to_owned())),
                Value::Scalar(Scalar::Utf8("x".to_owned())),
            ],
            1,
        )
        .expect("trim");
        assert_eq!(out, Value::Scalar(Scalar::Utf8("hi".to_owned())));
    }
}
