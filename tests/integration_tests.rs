use financial_analysis_forge::coordinator::{JOB_RUNNING, NOT_READY};
use financial_analysis_forge::*;
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;

const CAPITAL_IQ_EXPORT: &str = r#",,
Acme Industries,,
Income Statement,,
For the Fiscal Period Ending,12 months Dec-31-2022,12 months Dec-31-2023
Currency,USD,USD
Total Revenue,"1,200,000","1,500,000"
Cost Of Goods Sold,"(700,000)","(800,000)"
Gross Profit,"500,000","700,000"
Selling General & Admin Exp.,"(200,000)","(250,000)"
Operating Income,"300,000","450,000"
Interest Expense,"(20,000)","(25,000)"
EBT Excl. Unusual Items,"280,000","425,000"
EBT Incl. Unusual Items,"280,000","425,000"
Income Tax Expense,"(70,000)","(106,250)"
Net Income,"210,000","318,750"
Diluted EPS,2.10,3.19
"#;

fn grid_from_csv(data: &str) -> anyhow::Result<RawGrid> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(data.as_bytes());

    let mut records = Vec::new();
    for record in reader.records() {
        let record = record?;
        records.push(record.iter().map(str::to_string).collect::<Vec<_>>());
    }
    Ok(RawGrid::from_records(records))
}

fn two_year_grid() -> RawGrid {
    RawGrid::new(vec![
        vec![CellValue::Empty, "FY2023".into(), "FY2022".into()],
        vec!["Revenue".into(), 1000.0.into(), 900.0.into()],
        vec!["COGS".into(), (-400.0).into(), (-350.0).into()],
        vec!["Gross Profit".into(), 600.0.into(), 550.0.into()],
    ])
}

fn single_year_grid(year: i32, revenue: f64) -> RawGrid {
    RawGrid::from_records(vec![
        vec!["".to_string(), format!("FY{}", year)],
        vec!["Revenue".to_string(), revenue.to_string()],
    ])
}

#[test]
fn test_two_year_statement() {
    let outcome = process_income_statement(&two_year_grid(), &ForgeConfig::default()).unwrap();

    assert_eq!(outcome.period_ids(), vec!["FY2023", "FY2022"]);

    let gross_row = outcome
        .classified
        .iter()
        .find(|r| r.raw_label == "Gross Profit")
        .unwrap();
    assert_eq!(gross_row.item(), Some(CanonicalLineItem::GrossProfit));
    assert_eq!(gross_row.confidence(), 1.0);

    assert_eq!(
        outcome.statement.value("FY2023", CanonicalLineItem::GrossProfit),
        Some(600.0)
    );
    assert_eq!(
        outcome.statement.value("FY2023", CanonicalLineItem::CostOfGoodsSold),
        Some(400.0)
    );
    assert!(!outcome
        .anomalies
        .iter()
        .any(|a| matches!(a, Anomaly::SubtotalMismatch { .. })));

    let gross_margin = outcome
        .metrics
        .iter()
        .find(|m| m.name == MetricName::GrossMargin)
        .unwrap();
    assert_eq!(gross_margin.value("FY2023"), Some(0.6));
}

#[test]
fn test_abbreviated_total_revenue_label() {
    let classifier = LineItemClassifier::new(
        &AliasTable::default(),
        ForgeConfig::default().classification,
    );
    let row = classifier.classify(3, "Total Rev.");
    assert_eq!(row.item(), Some(CanonicalLineItem::Revenue));
    assert!(row.confidence() > 0.0);
}

#[test]
fn test_capital_iq_export() -> anyhow::Result<()> {
    let grid = grid_from_csv(CAPITAL_IQ_EXPORT)?;
    let outcome = process_income_statement(&grid, &ForgeConfig::default())?;

    assert_eq!(outcome.detection.header_row, 3);
    assert_eq!(outcome.period_ids(), vec!["FY2023", "FY2022"]);

    let statement = &outcome.statement;
    assert_eq!(statement.value("FY2023", CanonicalLineItem::Revenue), Some(1_500_000.0));
    assert_eq!(
        statement.value("FY2023", CanonicalLineItem::OperatingExpenses),
        Some(250_000.0)
    );
    assert_eq!(
        statement.value("FY2022", CanonicalLineItem::IncomeTaxExpense),
        Some(70_000.0)
    );

    let pretax = statement
        .cell("FY2023", CanonicalLineItem::PretaxIncome)
        .unwrap();
    assert_eq!(pretax.value, 425_000.0);
    assert_eq!(pretax.origin, ValueOrigin::Reported);
    assert_eq!(pretax.source_row, Some(12));
    assert!(outcome.anomalies.contains(&Anomaly::DuplicateLineItem {
        item: CanonicalLineItem::PretaxIncome,
        row_index: 11,
        raw_label: "EBT Excl. Unusual Items".to_string(),
        kept_row_index: 12,
    }));

    assert!(!outcome
        .anomalies
        .iter()
        .any(|a| matches!(a, Anomaly::SubtotalMismatch { .. })));
    let unclassified: Vec<&str> = outcome
        .anomalies
        .iter()
        .filter_map(|a| match a {
            Anomaly::UnclassifiedRow { raw_label, .. } => Some(raw_label.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(unclassified, vec!["Diluted EPS"]);

    let growth = outcome
        .metrics
        .iter()
        .find(|m| m.name == MetricName::YoYRevenueGrowth)
        .unwrap();
    assert_eq!(growth.value("FY2023"), Some(0.25));
    assert_eq!(growth.value("FY2022"), None);

    let net_margin = outcome
        .metrics
        .iter()
        .find(|m| m.name == MetricName::NetMargin)
        .unwrap()
        .value("FY2023")
        .unwrap();
    assert!((net_margin - 0.2125).abs() < 1e-9);

    let raw = outcome.raw_table();
    assert_eq!(raw.rows.len(), 11 * 2);
    assert_eq!(raw.get(0, "line_item"), Some("Total Revenue"));
    assert_eq!(raw.get(0, "period"), Some("FY2023"));
    assert_eq!(raw.get(0, "value_numeric"), Some("1500000"));

    Ok(())
}

#[test]
fn test_reported_subtotal_mismatch() {
    let grid = RawGrid::from_records(vec![
        vec!["", "FY2023"],
        vec!["Revenue", "1000"],
        vec!["Cost of Sales", "400"],
        vec!["Gross Profit", "700"],
    ]);
    let outcome = process_income_statement(&grid, &ForgeConfig::default()).unwrap();

    let mismatches: Vec<&Anomaly> = outcome
        .anomalies
        .iter()
        .filter(|a| matches!(a, Anomaly::SubtotalMismatch { .. }))
        .collect();
    assert_eq!(mismatches.len(), 1);
    assert_eq!(
        outcome.statement.value("FY2023", CanonicalLineItem::GrossProfit),
        Some(700.0)
    );
}

fn revenue_and_cogs_grid() -> RawGrid {
    RawGrid::from_records(vec![
        vec!["", "FY2023", "FY2022"],
        vec!["Revenue", "1000", "900"],
        vec!["COGS", "400", "350"],
    ])
}

#[test]
fn test_unreported_subtotal_stays_missing() {
    let outcome =
        process_income_statement(&revenue_and_cogs_grid(), &ForgeConfig::default()).unwrap();

    assert_eq!(
        outcome.statement.value("FY2023", CanonicalLineItem::GrossProfit),
        None
    );
    let gross_margin = outcome
        .metrics
        .iter()
        .find(|m| m.name == MetricName::GrossMargin)
        .unwrap();
    assert_eq!(gross_margin.value("FY2023"), None);
    assert_eq!(gross_margin.value("FY2022"), None);
}

#[test]
fn test_config_from_partial_json_enables_fill() {
    let config = ForgeConfig::from_json_str(
        r#"{ "assembly": { "fill_missing_subtotals": true } }"#,
    )
    .unwrap();
    assert_eq!(config.assembly.relative_tolerance, 0.01);

    let outcome = process_income_statement(&revenue_and_cogs_grid(), &config).unwrap();
    let gross = outcome
        .statement
        .cell("FY2023", CanonicalLineItem::GrossProfit)
        .unwrap();
    assert_eq!(gross.value, 600.0);
    assert_eq!(gross.origin, ValueOrigin::Computed);
}

#[test]
fn test_filled_pretax_does_not_flag_reported_net_income() {
    let config = ForgeConfig::from_json_str(
        r#"{ "assembly": { "fill_missing_subtotals": true } }"#,
    )
    .unwrap();
    let grid = RawGrid::from_records(vec![
        vec!["", "FY2023"],
        vec!["Revenue", "1000"],
        vec!["Cost of Goods Sold", "400"],
        vec!["Gross Profit", "600"],
        vec!["Operating Expenses", "300"],
        vec!["Operating Income", "300"],
        vec!["Interest Expense", "20"],
        vec!["Gain on Sale of Assets", "50"],
        vec!["Income Tax Expense", "66"],
        vec!["Net Income", "264"],
    ]);
    let outcome = process_income_statement(&grid, &config).unwrap();

    assert!(outcome.anomalies.contains(&Anomaly::UnclassifiedRow {
        row_index: 7,
        raw_label: "Gain on Sale of Assets".to_string(),
    }));
    assert!(!outcome
        .anomalies
        .iter()
        .any(|a| matches!(a, Anomaly::SubtotalMismatch { .. })));
    assert_eq!(
        outcome.statement.value("FY2023", CanonicalLineItem::NetIncome),
        Some(264.0)
    );
}

#[test]
fn test_random_headers_produce_ordered_unique_periods() {
    let mut rng = StdRng::seed_from_u64(7);

    for _ in 0..200 {
        let mut labels: Vec<String> = Vec::new();
        let count = rng.gen_range(1..8);
        for _ in 0..count {
            let year: i32 = rng.gen_range(2005..2030);
            let quarter: u32 = rng.gen_range(1..=4);
            let label = match rng.gen_range(0..6) {
                0 => format!("FY{}", year),
                1 => year.to_string(),
                2 => format!("FY {:02}", year % 100),
                3 => format!("Q{} {}", quarter, year),
                4 => format!("{}-Q{}", year, quarter),
                _ => format!("{}Q{:02}", quarter, year % 100),
            };
            labels.push(label);
        }
        labels.shuffle(&mut rng);

        let mut header = vec![String::new()];
        header.extend(labels.iter().cloned());
        let grid = RawGrid::from_records(vec![header]);

        let detection = PeriodDetector::new(ForgeConfig::default().periods)
            .detect(&grid, 0)
            .unwrap();

        assert!(!detection.periods.is_empty());
        for pair in detection.periods.windows(2) {
            assert!(
                pair[0].sort_key() > pair[1].sort_key(),
                "{:?} not after {:?} for {:?}",
                pair[0].id,
                pair[1].id,
                labels
            );
        }
        assert_eq!(
            detection.periods.len() + detection.duplicates.len(),
            labels.len(),
            "{:?}",
            labels
        );
    }
}

#[test]
fn test_random_mismatches_counted_exactly() {
    let mut rng = StdRng::seed_from_u64(11);

    for _ in 0..100 {
        let years: Vec<i32> = (2015..2015 + rng.gen_range(1..6)).rev().collect();
        let mut header = vec![String::new()];
        let mut revenue = vec!["Revenue".to_string()];
        let mut cogs = vec!["Cost of Goods Sold".to_string()];
        let mut gross = vec!["Gross Profit".to_string()];
        let mut injected = 0;

        for year in &years {
            let rev: f64 = rng.gen_range(1_000.0..1_000_000.0_f64).round();
            let cost: f64 = (rev * rng.gen_range(0.0..0.8_f64)).round();
            let mut reported = rev - cost;
            if rng.gen_bool(0.4) {
                reported += rev * 0.2 + 10.0;
                injected += 1;
            }
            header.push(format!("FY{}", year));
            revenue.push(rev.to_string());
            cogs.push(cost.to_string());
            gross.push(reported.to_string());
        }

        let grid = RawGrid::from_records(vec![header, revenue, cogs, gross]);
        let outcome = process_income_statement(&grid, &ForgeConfig::default()).unwrap();
        let mismatches = outcome
            .anomalies
            .iter()
            .filter(|a| matches!(a, Anomaly::SubtotalMismatch { .. }))
            .count();
        assert_eq!(mismatches, injected);

        let again = MetricsEngine::default().compute(&outcome.statement, &outcome.detection.periods);
        assert_eq!(again, outcome.metrics);
    }
}

#[test]
fn test_alias_table_extension() {
    let mut aliases = AliasTable::default();
    aliases
        .extend(vec![AliasEntry {
            alias: "Turnover".to_string(),
            item: CanonicalLineItem::Revenue,
            confidence: 1.0,
        }])
        .unwrap();
    let pipeline = ParsePipeline::with_aliases(ForgeConfig::default(), &aliases);
    let grid = RawGrid::from_records(vec![vec!["", "2023"], vec!["Turnover", "42"]]);
    let outcome = pipeline.run(&grid, None).unwrap();
    assert_eq!(
        outcome.statement.value("FY2023", CanonicalLineItem::Revenue),
        Some(42.0)
    );
}

#[tokio::test]
async fn test_start_while_running_leaves_job_untouched() {
    let coordinator = ParseJobCoordinator::default();

    let first = coordinator.start_parse("alice", single_year_grid(2023, 100.0));
    assert!(first.ok);

    let second = coordinator.start_parse("alice", single_year_grid(2019, 5.0));
    assert!(!second.ok);
    assert_eq!(second.error.as_deref(), Some("job_already_running"));

    let snapshot = coordinator.job_snapshot("alice");
    assert_eq!(snapshot.job_id, first.job_id);
    assert!(snapshot.state.is_running());

    assert_eq!(
        coordinator.wait_for_completion("alice").await,
        JobState::Completed
    );
    assert_eq!(coordinator.get_periods("alice").periods, vec!["FY2023"]);
}

#[tokio::test]
async fn test_cancel_before_first_stage() {
    let coordinator = ParseJobCoordinator::default();
    coordinator.start_parse("bob", two_year_grid());
    assert!(coordinator.cancel("bob"));

    match coordinator.wait_for_completion("bob").await {
        JobState::Failed { code, .. } => assert_eq!(code, "cancelled"),
        other => panic!("unexpected state {:?}", other),
    }

    let snapshot = coordinator.job_snapshot("bob");
    assert_eq!(snapshot.log.len(), 2);
    assert!(!snapshot.log.iter().any(|line| is_completion_line(line)));
    assert_eq!(
        coordinator.get_periods("bob").error.as_deref(),
        Some("failed: cancelled")
    );
}

#[tokio::test]
async fn test_caller_supplied_cancellation_token() {
    let coordinator = ParseJobCoordinator::default();
    let token = CancellationToken::new();
    token.cancel();
    coordinator.start_parse_with_cancel("carol", two_year_grid(), token);

    assert!(matches!(
        coordinator.wait_for_completion("carol").await,
        JobState::Failed { .. }
    ));
}

#[tokio::test]
async fn test_live_and_late_subscribers_see_same_events() {
    let coordinator = ParseJobCoordinator::default();
    coordinator.start_parse("dave", two_year_grid());

    let live: Vec<ProgressEvent> = coordinator
        .subscribe("dave")
        .unwrap()
        .into_stream()
        .collect()
        .await;

    let late: Vec<ProgressEvent> = coordinator
        .subscribe("dave")
        .unwrap()
        .into_stream()
        .collect()
        .await;

    assert_eq!(live, late);
    assert_eq!(live.len(), 6);
    assert!(matches!(live[0], ProgressEvent::Started { .. }));
    let stages: Vec<ParseStage> = live
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::StageCompleted { stage, .. } => Some(*stage),
            _ => None,
        })
        .collect();
    assert_eq!(stages, ParseStage::ALL.to_vec());
    assert!(live.last().unwrap().is_terminal());

    let lines: Vec<String> = coordinator
        .subscribe("dave")
        .unwrap()
        .into_lines()
        .collect()
        .await;
    assert!(is_completion_line(lines.last().unwrap()));
}

#[tokio::test]
async fn test_queries_follow_job_state() {
    let coordinator = ParseJobCoordinator::default();

    let before = coordinator.get_periods("erin");
    assert!(!before.ok);
    assert!(before.periods.is_empty());
    assert_eq!(before.error.as_deref(), Some(NOT_READY));

    coordinator.start_parse("erin", two_year_grid());
    let running = coordinator.get_statement_details("erin");
    assert!(!running.ok);
    assert_eq!(running.error.as_deref(), Some(JOB_RUNNING));

    coordinator.wait_for_completion("erin").await;

    let details = coordinator.get_statement_details("erin");
    assert!(details.ok);
    assert_eq!(details.table.columns, vec!["field", "value"]);
    assert_eq!(details.table.get(2, "value"), Some("FY2023"));

    let statement = coordinator.get_statement_for_period("erin", "FY2022");
    assert!(statement.ok);
    assert_eq!(statement.table.get(0, "line_item"), Some("Revenue"));
    assert_eq!(statement.table.get(0, "value"), Some("900"));

    let figures = coordinator.get_key_figures("erin", "FY2023");
    assert!(figures.ok);
    assert_eq!(figures.figures[0].bar_pct, 100);
    assert_eq!(figures.figures[1].bar_pct, 60);

    let series = coordinator.get_line_item_series("erin", "gross profit");
    let series = series.series.unwrap();
    assert_eq!(series.label, "Gross Profit");
    assert_eq!(series.latest, Some(600.0));
    assert_eq!(series.average, Some(575.0));

    let missing = coordinator.get_line_item_series("erin", "Dividends");
    assert!(!missing.ok);
}

#[tokio::test]
async fn test_new_parse_replaces_finished_result() {
    let coordinator = ParseJobCoordinator::default();

    coordinator.start_parse("frank", single_year_grid(2021, 10.0));
    coordinator.wait_for_completion("frank").await;
    assert_eq!(coordinator.get_periods("frank").periods, vec!["FY2021"]);

    let restart = coordinator.start_parse("frank", single_year_grid(2024, 20.0));
    assert!(restart.ok);
    assert!(!coordinator.get_periods("frank").ok);

    coordinator.wait_for_completion("frank").await;
    assert_eq!(coordinator.get_periods("frank").periods, vec!["FY2024"]);
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let coordinator = ParseJobCoordinator::default();
    assert!(coordinator.start_parse("s1", single_year_grid(2020, 1.0)).ok);
    assert!(coordinator.start_parse("s2", single_year_grid(2022, 2.0)).ok);

    coordinator.wait_for_completion("s1").await;
    coordinator.wait_for_completion("s2").await;

    assert_eq!(coordinator.get_periods("s1").periods, vec!["FY2020"]);
    assert_eq!(coordinator.get_periods("s2").periods, vec!["FY2022"]);
}

#[tokio::test]
async fn test_workbook_job_records_sheet_name() {
    let coordinator = ParseJobCoordinator::default();
    let workbook = Workbook::new(vec![
        Sheet {
            name: "Cover".to_string(),
            grid: RawGrid::default(),
        },
        Sheet {
            name: "Income Statement".to_string(),
            grid: two_year_grid(),
        },
    ]);
    assert!(coordinator.start_parse_workbook("gina", &workbook).ok);
    coordinator.wait_for_completion("gina").await;

    let details = coordinator.get_statement_details("gina");
    assert_eq!(details.table.get(0, "value"), Some("Income Statement"));
}

#[test]
fn test_schema_generation() {
    let schema = ForgeConfig::schema_as_json().unwrap();
    assert!(schema.contains("relative_tolerance"));
    let aliases = AliasTable::schema_as_json().unwrap();
    assert!(aliases.contains("confidence"));
}
