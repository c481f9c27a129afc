use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use futures::{FutureExt, StreamExt, future, stream};
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::Value;

use super::error::{FormResult, ValidationError, ValidatorFault};
use super::validation::{Outcome, Validator, ValidatorContext, ValidatorResult};

static EMAIL: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$",
    )
});

static URL: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(r"^(?:[a-zA-Z][a-zA-Z0-9+.-]*:)?//(?:[^\s/?#@]+@)?[^\s/?#:]+(?::\d+)?(?:[/?#]\S*)?$")
});

fn is_empty_input(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Numbers arrive either as JSON numbers or as text from an input.
fn as_decimal(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::Number(number) => number.to_string(),
        Value::String(text) => text.trim().to_string(),
        _ => return None,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

fn decimal_value(decimal: Decimal) -> Value {
    Value::from_str(&decimal.normalize().to_string())
        .unwrap_or_else(|_| Value::String(decimal.to_string()))
}

fn input_length(value: &Value) -> Option<usize> {
    match value {
        Value::String(text) => Some(text.chars().count()),
        Value::Array(items) => Some(items.len()),
        _ => None,
    }
}

pub fn required() -> Validator {
    Validator::new(|value, _| {
        Ok(is_empty_input(value)
            .then(|| ValidationError::new("required").with_actual(value.clone())))
    })
    .named("required")
}

/// Passes only for `true`, e.g. an "accept terms" checkbox.
pub fn required_true() -> Validator {
    Validator::new(|value, _| {
        Ok((value != &Value::Bool(true)).then(|| {
            ValidationError::new("requiredTrue")
                .with_actual(value.clone())
                .with_expect(true)
        }))
    })
    .named("requiredTrue")
}

pub fn min(limit: Decimal) -> Validator {
    Validator::new(move |value, _| {
        if is_empty_input(value) {
            return Ok(None);
        }
        Ok(match as_decimal(value) {
            Some(actual) if actual >= limit => None,
            _ => Some(
                ValidationError::new("min")
                    .with_actual(value.clone())
                    .with_limit(decimal_value(limit)),
            ),
        })
    })
    .named("min")
}

pub fn max(limit: Decimal) -> Validator {
    Validator::new(move |value, _| {
        if is_empty_input(value) {
            return Ok(None);
        }
        Ok(match as_decimal(value) {
            Some(actual) if actual <= limit => None,
            _ => Some(
                ValidationError::new("max")
                    .with_actual(value.clone())
                    .with_limit(decimal_value(limit)),
            ),
        })
    })
    .named("max")
}

/// Minimum number of characters for text, or items for lists.
pub fn min_length(limit: usize) -> Validator {
    Validator::new(move |value, _| {
        if is_empty_input(value) {
            return Ok(None);
        }
        Ok(match input_length(value) {
            Some(length) if length >= limit => None,
            length => Some(
                ValidationError::new("minLength")
                    .with_actual(length.map_or(Value::Null, Value::from))
                    .with_limit(limit),
            ),
        })
    })
    .named("minLength")
}

pub fn max_length(limit: usize) -> Validator {
    Validator::new(move |value, _| {
        if is_empty_input(value) {
            return Ok(None);
        }
        Ok(match input_length(value) {
            Some(length) if length <= limit => None,
            length => Some(
                ValidationError::new("maxLength")
                    .with_actual(length.map_or(Value::Null, Value::from))
                    .with_limit(limit),
            ),
        })
    })
    .named("maxLength")
}

pub fn pattern(regex: Regex) -> Validator {
    matching("pattern", move || Ok(regex.clone()))
}

pub fn email() -> Validator {
    matching("email", || shared(&EMAIL))
}

pub fn url() -> Validator {
    matching("url", || shared(&URL))
}

fn shared(regex: &LazyLock<Result<Regex, regex::Error>>) -> Result<Regex, ValidatorFault> {
    regex
        .as_ref()
        .map(Regex::clone)
        .map_err(|error| ValidatorFault::from_error(error))
}

fn matching<F>(name: &'static str, regex: F) -> Validator
where
    F: Fn() -> Result<Regex, ValidatorFault> + Send + Sync + 'static,
{
    Validator::new(move |value, _| {
        if is_empty_input(value) {
            return Ok(None);
        }
        let regex = regex()?;
        let matched = value.as_str().is_some_and(|text| regex.is_match(text));
        Ok((!matched).then(|| {
            ValidationError::new(name)
                .with_actual(value.clone())
                .with_expect(regex.as_str())
        }))
    })
    .named(name)
}

/// Runs `validator` only while `condition` holds. A condition error, such as
/// a missing form context, becomes a validator fault.
pub fn when<C>(condition: C, validator: Validator) -> Validator
where
    C: Fn(&ValidatorContext) -> FormResult<bool> + Send + Sync + 'static,
{
    let name = validator.name().to_string();
    Validator::from_fn(validator.is_async(), move |value, ctx| match condition(ctx) {
        Ok(true) => validator.call(value, ctx),
        Ok(false) => Outcome::valid(),
        Err(error) => Outcome::fault(error.into()),
    })
    .named(&name)
}

/// Like [`when`] with an asynchronous condition. The result is always an
/// asynchronous validator.
pub fn when_async<C, Fut>(condition: C, validator: Validator) -> Validator
where
    C: Fn(&ValidatorContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FormResult<bool>> + Send + 'static,
{
    let name = validator.name().to_string();
    Validator::from_fn(true, move |value, ctx| {
        let validator = validator.clone();
        let value = value.clone();
        let ctx = ctx.clone();
        let outcomes = stream::once(condition(&ctx)).flat_map(move |holds| match holds {
            Ok(true) => into_stream(validator.call(&value, &ctx)),
            Ok(false) => stream::once(future::ready(Ok(None))).boxed(),
            Err(error) => stream::once(future::ready(Err(error.into()))).boxed(),
        });
        Outcome::Stream(outcomes.boxed())
    })
    .named(&name)
}

/// Replaces the message of every error `validator` reports.
pub fn with_message(validator: Validator, message: impl Into<String>) -> Validator {
    let message: Arc<str> = Arc::from(message.into());
    let name = validator.name().to_string();
    Validator::from_fn(validator.is_async(), move |value, ctx| {
        let message = message.clone();
        let relabel = move |result: ValidatorResult| {
            result.map(|error| error.map(|error| error.with_message(message.as_ref())))
        };
        match validator.call(value, ctx) {
            Outcome::Ready(result) => Outcome::Ready(relabel(result)),
            Outcome::Deferred(future) => Outcome::Deferred(future.map(relabel).boxed()),
            Outcome::Stream(stream) => Outcome::Stream(stream.map(relabel).boxed()),
        }
    })
    .named(&name)
}

fn into_stream(outcome: Outcome) -> futures::stream::BoxStream<'static, ValidatorResult> {
    match outcome {
        Outcome::Ready(result) => stream::once(future::ready(result)).boxed(),
        Outcome::Deferred(future) => stream::once(future).boxed(),
        Outcome::Stream(stream) => stream,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form::{CancelToken, FieldModel};
    use futures::executor::block_on;
    use serde_json::json;

    fn detached_context() -> ValidatorContext {
        ValidatorContext::new(
            FieldModel::new(Value::Null).to_model(),
            CancelToken::detached(),
        )
    }

    fn run(validator: &Validator, value: Value) -> Option<ValidationError> {
        let ctx = detached_context();
        match validator.call(&value, &ctx) {
            Outcome::Ready(result) => result.expect("validator result"),
            Outcome::Deferred(future) => block_on(future).expect("validator result"),
            Outcome::Stream(stream) => block_on(stream.collect::<Vec<_>>())
                .into_iter()
                .last()
                .expect("at least one emission")
                .expect("validator result"),
        }
    }

    #[test]
    fn required_rejects_empty_inputs() {
        let validator = required();
        assert!(run(&validator, json!(null)).is_some());
        assert!(run(&validator, json!("")).is_some());
        assert!(run(&validator, json!([])).is_some());
        assert!(run(&validator, json!("x")).is_none());
        assert!(run(&validator, json!(0)).is_none());
    }

    #[test]
    fn numeric_bounds_accept_numeric_text() {
        let validator = min(Decimal::from(18));
        assert!(run(&validator, json!("17.5")).is_some());
        assert!(run(&validator, json!(18)).is_none());
        assert!(run(&validator, json!("")).is_none());
        let error = run(&validator, json!("abc")).expect("non numeric text fails");
        assert_eq!(error.limit, Some(json!(18)));

        let validator = max(Decimal::new(25, 1));
        assert!(run(&validator, json!(2.5)).is_none());
        assert!(run(&validator, json!("2.51")).is_some());
    }

    #[test]
    fn length_bounds_count_characters() {
        let error = run(&max_length(3), json!("héllo")).expect("too long");
        assert_eq!(error.name, "maxLength");
        assert_eq!(error.actual, Some(json!(5)));
        assert_eq!(error.limit, Some(json!(3)));
        assert!(run(&min_length(2), json!(["a", "b"])).is_none());
    }

    #[test]
    fn email_and_url_patterns() {
        assert!(run(&email(), json!("dev@example.com")).is_none());
        assert!(run(&email(), json!("dev@")).is_some());
        assert!(run(&url(), json!("https://example.com/path?q=1")).is_none());
        assert!(run(&url(), json!("not a url")).is_some());
        let digits = pattern(Regex::new(r"^\d+$").expect("valid regex"));
        assert!(run(&digits, json!("123")).is_none());
        assert_eq!(run(&digits, json!("12a")).expect("mismatch").name, "pattern");
    }

    #[test]
    fn when_skips_unless_condition_holds() {
        let validator = when(|_| Ok(false), required());
        assert!(run(&validator, json!(null)).is_none());
        let validator = when(|_| Ok(true), required());
        assert!(run(&validator, json!(null)).is_some());
        assert_eq!(validator.name(), "required");
    }

    #[test]
    fn when_reports_condition_errors_as_faults() {
        let validator = when(|ctx| ctx.get_form_value().map(|_| true), required());
        let ctx = detached_context();
        match validator.call(&json!(null), &ctx) {
            Outcome::Ready(Err(fault)) => assert!(fault.message().contains("outside of any form")),
            _ => panic!("expected a ready fault"),
        }
    }

    #[test]
    fn when_async_is_flagged_async() {
        let validator = when_async(|_| async { Ok(true) }, required());
        assert!(validator.is_async());
        assert!(run(&validator, json!("")).is_some());
    }

    #[test]
    fn with_message_relabels_errors() {
        let validator = with_message(required(), "Please fill in");
        let error = run(&validator, json!(null)).expect("required");
        assert_eq!(error.message(), "Please fill in");
        assert_eq!(error.name, "required");
    }
}
