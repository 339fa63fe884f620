//! Upstream payload mapping
//!
//! The billing platform has shipped several shapes for the same entities over
//! time (nested objects vs flat ids, camelCase vs snake_case prices, different
//! pagination envelopes). This module is the only code that reads raw upstream
//! JSON; each field is resolved through a fixed precedence list and everything
//! downstream sees typed records with prices in integer cents.
//!
//! | field            | precedence                                             |
//! |------------------|--------------------------------------------------------|
//! | plan name        | `internal_notes`, `title`, `name`, `description`       |
//! | initial price    | `initial_price`, `initialPrice` (major units, else 0)  |
//! | renewal price    | `renewal_price`, `renewalPrice` (major units, else 0)  |
//! | plan type        | `plan_type`, `type`, `planType` (default `renewal`)    |
//! | product id       | `product.id`, `product_id`, `access_pass_id`           |
//! | user id          | `user.id`, `user_id`                                   |
//! | plan id          | `plan.id`, `plan_id`                                   |
//! | company id       | `company.id`, `company_id`                             |
//! | list items       | `data`, resource key, bare array                       |
//! | next cursor      | `page_info.end_cursor`, `page_info.next_cursor`,       |
//! |                  | `pagination.end_cursor`, `pagination.next_cursor`      |

use serde_json::Value;
use upshift_shared::PlanType;

use crate::models::{Membership, Plan, Product};

/// Walk a nested path of object keys
fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut cur = value;
    for key in path {
        cur = cur.get(*key)?;
    }
    Some(cur)
}

/// First non-empty string found along the given paths
pub fn first_str(value: &Value, paths: &[&[&str]]) -> Option<String> {
    paths.iter().find_map(|path| {
        lookup(value, path)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

/// First non-null value found along the given paths
fn first_present<'a>(value: &'a Value, paths: &[&[&str]]) -> Option<&'a Value> {
    paths
        .iter()
        .find_map(|path| lookup(value, path).filter(|v| !v.is_null()))
}

/// Convert a major-unit price (e.g. `149.95`) to integer cents (`14995`)
///
/// Accepts JSON numbers and numeric strings. Absent, null or non-numeric
/// values become 0.
pub fn price_to_cents(value: Option<&Value>) -> i64 {
    let major = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match major {
        Some(m) if m.is_finite() => (m * 100.0).round() as i64,
        _ => 0,
    }
}

fn plan_type_from(raw: &Value) -> PlanType {
    match first_str(raw, &[&["plan_type"], &["type"], &["planType"]]) {
        None => PlanType::Renewal,
        Some(s) => match s.parse::<PlanType>() {
            Ok(t) => t,
            Err(_) => {
                tracing::debug!(plan_type = %s, "Unrecognized plan type, treating as one-time");
                PlanType::OneTime
            }
        },
    }
}

/// Format cents as a monthly price label, or `Free`
pub fn price_label(cents: i64) -> String {
    if cents > 0 {
        format!("${}.{:02}/mo", cents / 100, cents % 100)
    } else {
        "Free".to_string()
    }
}

/// Build the display title of a plan
///
/// Plans rarely carry a title of their own; the operator's internal notes
/// ("Starter", "Growth") are combined with the product title and the price.
pub fn plan_title(plan_name: Option<&str>, product_title: Option<&str>, price_cents: i64) -> String {
    let price = price_label(price_cents);
    let product_title = product_title.filter(|t| !t.is_empty());

    match plan_name {
        Some(name) if !name.contains('$') && !name.contains("/mo") => match product_title {
            Some(product) => format!("{} - {} - {}", product, name, price),
            None => format!("{} - {}", name, price),
        },
        Some(name) => match product_title {
            Some(product) => format!("{} - {}", product, name),
            None => name.to_string(),
        },
        None => match product_title {
            Some(product) => format!("{} - {}", product, price),
            None => price,
        },
    }
}

/// Map an upstream plan object
pub fn plan_from_upstream(raw: &Value) -> Plan {
    let initial_price_cents =
        price_to_cents(first_present(raw, &[&["initial_price"], &["initialPrice"]]));
    let renewal_price_cents =
        price_to_cents(first_present(raw, &[&["renewal_price"], &["renewalPrice"]]));

    let plan_name = first_str(
        raw,
        &[&["internal_notes"], &["title"], &["name"], &["description"]],
    );
    let product_title = first_str(raw, &[&["product", "title"]]);
    let display_price = if renewal_price_cents != 0 {
        renewal_price_cents
    } else {
        initial_price_cents
    };

    Plan {
        id: first_str(raw, &[&["id"]]).unwrap_or_default(),
        title: plan_title(plan_name.as_deref(), product_title.as_deref(), display_price),
        product_id: first_str(
            raw,
            &[&["product", "id"], &["product_id"], &["access_pass_id"]],
        )
        .unwrap_or_default(),
        plan_type: plan_type_from(raw),
        initial_price_cents,
        renewal_price_cents,
    }
}

/// Map an upstream membership object
pub fn membership_from_upstream(raw: &Value) -> Membership {
    Membership {
        id: first_str(raw, &[&["id"]]).unwrap_or_default(),
        user_id: first_str(raw, &[&["user", "id"], &["user_id"]]).unwrap_or_default(),
        product_id: first_str(raw, &[&["product", "id"], &["product_id"]]).unwrap_or_default(),
        plan_id: first_str(raw, &[&["plan", "id"], &["plan_id"]]).unwrap_or_default(),
        status: first_str(raw, &[&["status"]]).unwrap_or_else(|| "unknown".to_string()),
        canceled_at: first_present(raw, &[&["canceled_at"]]).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }),
        cancel_at_period_end: raw
            .get("cancel_at_period_end")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}

/// Map an upstream product object
pub fn product_from_upstream(raw: &Value) -> Product {
    Product {
        id: first_str(raw, &[&["id"]]).unwrap_or_default(),
        title: first_str(raw, &[&["title"], &["name"]]).unwrap_or_default(),
        company_id: first_str(raw, &[&["company", "id"], &["company_id"]]).unwrap_or_default(),
    }
}

/// Items of one list page
pub fn page_items(body: &Value, resource_key: &str) -> Vec<Value> {
    body.get("data")
        .and_then(Value::as_array)
        .or_else(|| body.get(resource_key).and_then(Value::as_array))
        .or_else(|| body.as_array())
        .cloned()
        .unwrap_or_default()
}

/// Cursor of the following page, if the provider reports one
pub fn next_cursor(body: &Value) -> Option<String> {
    let has_next = first_present(
        body,
        &[&["page_info", "has_next_page"], &["pagination", "has_next_page"]],
    )
    .and_then(Value::as_bool);

    if has_next == Some(false) {
        return None;
    }

    first_str(
        body,
        &[
            &["page_info", "end_cursor"],
            &["page_info", "next_cursor"],
            &["pagination", "end_cursor"],
            &["pagination", "next_cursor"],
        ],
    )
}
