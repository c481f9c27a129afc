use std::sync::Arc;
use std::time::Duration;

use calmform::form::{InMemoryDraftStore, ItemFactory};
use calmform::prelude::*;
use futures::StreamExt;
use futures::executor::{LocalPool, block_on};
use futures::task::LocalSpawnExt;
use futures_timer::Delay;
use rust_decimal::Decimal;
use serde_json::json;

fn signup_form() -> FormResult<FormModel> {
    let form = FormModel::new();
    form.field("email", "")?
        .to_model()
        .set_validators(vec![validators::required(), validators::email()]);
    form.field("age", "")?
        .to_model()
        .set_validators(vec![validators::min(Decimal::from(18))]);
    form.field("password", "")?
        .to_model()
        .add_validator(validators::min_length(8));
    form.field("confirm", "")?.to_model().add_validator(
        Validator::new(|value, ctx| {
            let section = ctx.get_section_value(&["password"])?;
            Ok((section.get("password") != Some(value))
                .then(|| ValidationError::new("mismatch").with_message("Passwords differ")))
        })
        .named("matchesPassword"),
    );
    let phone: ItemFactory = Arc::new(|value| {
        FieldModel::new(value)
            .with_validator(validators::pattern(
                regex::Regex::new(r"^\+?\d{6,}$").expect("phone pattern"),
            ))
            .to_model()
    });
    form.field_array("phones", Some(phone))?;
    Ok(form)
}

#[test]
fn signup_form_validates_whole_tree() {
    let form = signup_form().expect("signup form");
    form.patch_value(json!({
        "email": "ada.example.com",
        "age": "17",
        "password": "hunter22",
        "confirm": "hunter2",
        "phones": ["+4712345678", "call me"],
    }))
    .expect("patch");

    block_on(form.validate_all());
    let errors = ["email", "age", "confirm"]
        .iter()
        .map(|key| {
            form.get(key)
                .and_then(|model| model.error())
                .map(|error| error.name)
        })
        .collect::<Vec<_>>();
    assert_eq!(
        errors,
        vec![
            Some("email".to_string()),
            Some("min".to_string()),
            Some("mismatch".to_string()),
        ]
    );
    assert!(form.get("password").and_then(|model| model.error()).is_none());

    let phones = match form.get("phones") {
        Some(Model::Array(phones)) => phones,
        other => panic!("expected phones array, got {other:?}"),
    };
    let phone_errors = phones
        .items()
        .iter()
        .map(|item| item.model().and_then(|model| model.error()).is_some())
        .collect::<Vec<_>>();
    assert_eq!(phone_errors, vec![false, true]);
    assert!(!form.valid());

    form.patch_value(json!({
        "email": "ada@example.com",
        "age": 36,
        "confirm": "hunter22",
        "phones": ["+4712345678"],
    }))
    .expect("fix values");
    block_on(form.validate_all());
    assert!(form.valid());
    assert_eq!(form.get_raw_value()["phones"], json!(["+4712345678"]));
}

#[test]
fn validating_stream_tracks_async_work_on_a_local_executor() {
    let form = FormModel::new();
    let handle = form
        .field("handle", "ada")
        .expect("handle field")
        .with_validator(validators::when_async(
            |ctx| {
                let enabled = ctx.get_form_value().map(|value| value["handle"] != json!(""));
                async move {
                    Delay::new(Duration::from_millis(10)).await;
                    enabled
                }
            },
            Validator::new(|value, _| {
                Ok((value == &json!("ada")).then(|| ValidationError::new("taken")))
            }),
        ));

    let mut pool = LocalPool::new();
    let transitions = form.validating().listen().take(3).collect::<Vec<_>>();
    let validation = handle.validate(ValidateOption::IGNORE_TOUCHED);
    let spawner = pool.spawner();
    spawner
        .spawn_local(async move {
            validation.await;
        })
        .expect("spawn validation");

    let seen = pool.run_until(transitions);
    assert_eq!(seen, vec![false, true, false]);
    assert_eq!(handle.error().map(|error| error.name), Some("taken".to_string()));
}

#[test]
fn references_bind_late_and_drafts_restore_values() {
    let form = FormModel::new();
    let contacts = form.field_array("contacts", None).expect("contacts array");
    contacts
        .initialize(json!([{ "name": "Ada" }, { "name": "Grace" }]))
        .expect("initialize contacts");
    assert!(form.pristine());

    let first = contacts
        .get(0)
        .and_then(|item| item.reference().cloned())
        .expect("first reference");
    let contact = FieldSetModel::new();
    contact.field("name", "").expect("name field");
    first.set_model(contact.clone()).expect("bind contact");
    assert_eq!(contact.get_raw_value(), json!({ "name": "Ada" }));
    assert_eq!(
        contact.get("name").map(|model| model.path()),
        Some("contacts.0.name".to_string())
    );

    contact
        .patch_value(json!({ "name": "Ada Lovelace" }))
        .expect("rename");
    assert!(form.dirty());

    let store = InMemoryDraftStore::new();
    form.save_draft(&store).expect("save draft");
    form.reset();
    assert_eq!(contact.get_raw_value(), json!({ "name": "Ada" }));

    assert!(form.load_draft(&store).expect("load draft"));
    assert_eq!(
        form.get_raw_value(),
        json!({ "contacts": [{ "name": "Ada Lovelace" }, { "name": "Grace" }] })
    );
}
