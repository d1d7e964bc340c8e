use std::cmp::Ordering;

use serde_json::Value;

use crate::daton::{Row, value_key_string};
use crate::key::{DatonKey, KeyKind};
use crate::schema::DatonDef;

/// Order JSON scalars: nulls first, then booleans, numbers, strings.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Answer a query key from candidate main rows: keep rows whose columns
/// equal every criterion, project onto the viewon's columns, sort and cut
/// out the requested page. Returns the page and whether it is complete.
pub fn query_rows(def: &DatonDef, key: &DatonKey, candidates: Vec<Row>, page_size: usize) -> (Vec<Row>, bool) {
    let KeyKind::Query {
        criteria,
        sort,
        page,
        ..
    } = key.kind()
    else {
        return (candidates, true);
    };

    let table = &def.main_table;
    let mut rows: Vec<Row> = candidates
        .into_iter()
        .filter(|row| {
            criteria.iter().all(|(name, wanted)| {
                row.get(name).and_then(value_key_string).as_deref() == Some(wanted.as_str())
            })
        })
        .map(|row| Row {
            values: row
                .values
                .into_iter()
                .filter(|(col, _)| table.find_col(col).is_some())
                .collect(),
            children: Default::default(),
        })
        .collect();

    if let Some(sort) = sort {
        let null = Value::Null;
        rows.sort_by(|a, b| compare_values(a.get(sort).unwrap_or(&null), b.get(sort).unwrap_or(&null)));
    }

    let page_size = page_size.max(1);
    let start = page.unwrap_or(0) as usize * page_size;
    let total = rows.len();
    let end = (start + page_size).min(total);
    let complete = end >= total;
    let page_rows = if start < total {
        rows.drain(start..end).collect()
    } else {
        Vec::new()
    };
    (page_rows, complete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColDef, ColType, TableDef};
    use serde_json::json;

    fn list_def() -> DatonDef {
        DatonDef::viewon(
            "CustomerList",
            TableDef::new("Customer", "CustomerId")
                .col(ColDef::new("CustomerId", ColType::Int))
                .col(ColDef::new("Company", ColType::String))
                .col(ColDef::new("City", ColType::String)),
        )
    }

    fn rows() -> Vec<Row> {
        vec![
            Row::new().with("CustomerId", 1).with("Company", "Zeta").with("City", "Oslo").with("Secret", 1),
            Row::new().with("CustomerId", 2).with("Company", "Acme").with("City", "Oslo"),
            Row::new().with("CustomerId", 3).with("Company", "Beta").with("City", "Bergen"),
        ]
    }

    #[test]
    fn test_filter_sort_project() {
        let key = DatonKey::query("CustomerList", [("City", "Oslo")], Some("Company".into()), None).unwrap();
        let (page, complete) = query_rows(&list_def(), &key, rows(), 10);
        assert!(complete);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].get("Company").unwrap(), "Acme");
        assert!(page[1].get("Secret").is_none());
    }

    #[test]
    fn test_paging_marks_incomplete() {
        let first = DatonKey::query("CustomerList", Vec::<(String, String)>::new(), Some("CustomerId".into()), Some(0)).unwrap();
        let (page, complete) = query_rows(&list_def(), &first, rows(), 2);
        assert_eq!(page.len(), 2);
        assert!(!complete);

        let second = DatonKey::query("CustomerList", Vec::<(String, String)>::new(), Some("CustomerId".into()), Some(1)).unwrap();
        let (page, complete) = query_rows(&list_def(), &second, rows(), 2);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].get("CustomerId").unwrap(), &json!(3));
        assert!(complete);
    }

    #[test]
    fn test_compare_values() {
        assert_eq!(compare_values(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(compare_values(&json!(null), &json!("a")), Ordering::Less);
        assert_eq!(compare_values(&json!("b"), &json!("a")), Ordering::Greater);
    }
}
