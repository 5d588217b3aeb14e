use std::collections::BTreeMap;

use criterion::{criterion_group, criterion_main, Criterion};
use orgscope_core::{
    build_filter, stage_rows, BusinessUnitId, CompanyId, FieldRule, FieldTransform, FieldValue,
    FilterCondition, FilterMode, FilterOperator, ImportFilter, LocationId, MappingContent,
    OrgAccessContext, OrgRole, OrgScope, Row, UserId,
};

fn bench_scope_filter(c: &mut Criterion) {
    let companies = (0..8).map(|_| CompanyId::new()).collect::<Vec<_>>();
    let units = (0..32).map(|_| BusinessUnitId::new()).collect::<Vec<_>>();
    let locations = (0..128).map(|_| LocationId::new()).collect::<Vec<_>>();
    let scopes = (0..10_000)
        .map(|index| match index % 4 {
            0 => OrgScope::default(),
            1 => OrgScope::company(companies[index % companies.len()]),
            2 => OrgScope::business_unit(
                companies[index % companies.len()],
                units[index % units.len()],
            ),
            _ => OrgScope::location(
                companies[index % companies.len()],
                units[index % units.len()],
                locations[index % locations.len()],
            ),
        })
        .collect::<Vec<_>>();

    let user_id = match UserId::parse("bench") {
        Ok(id) => id,
        Err(err) => panic!("invalid bench user: {err}"),
    };
    let context = OrgAccessContext {
        company_id: Some(companies[0]),
        context_role: Some(OrgRole::Admin),
        ..OrgAccessContext::unassigned(user_id)
    };

    c.bench_function("company_admin_filter_10000_rows", |b| {
        b.iter(|| {
            let filter = build_filter(&context);
            scopes.iter().filter(|scope| filter.matches(scope)).count()
        });
    });
}

fn bench_stage_rows(c: &mut Criterion) {
    let content = MappingContent {
        entity_type: "sales_record".to_string(),
        key_field: Some("invoice".to_string()),
        rules: vec![
            FieldRule {
                target: "invoice".to_string(),
                transform: FieldTransform::TrimUpper { source: "Invoice".to_string() },
                required: true,
            },
            FieldRule {
                target: "amount".to_string(),
                transform: FieldTransform::Number { source: "Amount".to_string() },
                required: true,
            },
        ],
    };
    let filter = ImportFilter {
        mode: FilterMode::All,
        conditions: vec![FilterCondition {
            field: "Amount".to_string(),
            operator: FilterOperator::GreaterThan,
            value: Some("10".to_string()),
            value_end: None,
        }],
    };
    let rows = (0..5_000)
        .map(|index| -> Row {
            BTreeMap::from([
                ("Invoice".to_string(), FieldValue::Text(format!("inv-{index}"))),
                ("Amount".to_string(), FieldValue::Text(format!("{}", index % 100))),
            ])
        })
        .collect::<Vec<_>>();

    c.bench_function("stage_rows_5000_filtered", |b| {
        b.iter(|| {
            if let Err(err) = stage_rows(&content, Some(&filter), &rows) {
                panic!("bench staging failed: {err}");
            }
        });
    });
}

criterion_group!(filter_benches, bench_scope_filter, bench_stage_rows);
criterion_main!(filter_benches);
