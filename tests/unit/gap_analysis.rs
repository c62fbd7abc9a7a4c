//! Unit tests for missing-range detection and expected-gap filtering

use crate::support::{bars_in, range, HOUR, DAY, MONDAY};
use market_data_loader::planner::{missing_from_coverage, GapAnalyzer, TradingCalendar};
use market_data_loader::store::{LocalStore, MemoryStore};
use market_data_loader::Granularity;
use std::collections::HashMap;
use std::time::Duration;

const SATURDAY: i64 = MONDAY + 5 * DAY;
const NEXT_MONDAY: i64 = MONDAY + 7 * DAY;

fn analyzer() -> GapAnalyzer {
    GapAnalyzer::new().with_continuous_symbols(vec!["BTCUSD".to_string()])
}

#[test]
fn test_weekend_hole_is_expected_for_weekday_symbols() {
    // Last Friday bar closes at 22:00; trading resumes Monday.
    let coverage = vec![
        range(MONDAY, SATURDAY - 2 * HOUR),
        range(NEXT_MONDAY, NEXT_MONDAY + DAY),
    ];
    let requested = range(MONDAY, NEXT_MONDAY + DAY);

    let gaps = analyzer().analyze("AAPL", Granularity::OneHour, &coverage, requested);
    assert!(gaps.is_empty(), "{gaps:?}");
}

#[test]
fn test_weekend_hole_is_missing_for_continuous_symbols() {
    let coverage = vec![
        range(MONDAY, SATURDAY - 2 * HOUR),
        range(NEXT_MONDAY, NEXT_MONDAY + DAY),
    ];
    let requested = range(MONDAY, NEXT_MONDAY + DAY);

    let gaps = analyzer().analyze("btcusd", Granularity::OneHour, &coverage, requested);
    assert_eq!(gaps, vec![range(SATURDAY - 2 * HOUR, NEXT_MONDAY)]);
}

#[test]
fn test_short_edge_gap_is_kept_but_closed_edge_is_not() {
    let coverage = vec![range(MONDAY, MONDAY + 3 * DAY)];

    let open_edge = analyzer().analyze(
        "AAPL",
        Granularity::OneHour,
        &coverage,
        range(MONDAY, MONDAY + 3 * DAY + 2 * HOUR),
    );
    assert_eq!(open_edge, vec![range(MONDAY + 3 * DAY, MONDAY + 3 * DAY + 2 * HOUR)]);

    let weekend_edge = analyzer().analyze(
        "AAPL",
        Granularity::OneHour,
        &[range(MONDAY, SATURDAY)],
        range(MONDAY, SATURDAY + 36 * HOUR),
    );
    assert!(weekend_edge.is_empty());
}

#[test]
fn test_interior_threshold_depends_on_granularity() {
    let coverage = vec![
        range(MONDAY, MONDAY + DAY),
        range(MONDAY + 3 * DAY, MONDAY + 4 * DAY),
    ];
    let requested = range(MONDAY, MONDAY + 4 * DAY);

    // Two trading days clears the intraday threshold (1d) and the daily one (2d).
    for granularity in [Granularity::OneHour, Granularity::OneDay] {
        let gaps = analyzer().analyze("AAPL", granularity, &coverage, requested);
        assert_eq!(gaps, vec![range(MONDAY + DAY, MONDAY + 3 * DAY)]);
    }

    // A single missing day is a holiday-sized hole on daily bars.
    let holiday = vec![
        range(MONDAY, MONDAY + 2 * DAY),
        range(MONDAY + 3 * DAY, MONDAY + 4 * DAY),
    ];
    assert!(analyzer()
        .analyze("AAPL", Granularity::OneDay, &holiday, requested)
        .is_empty());
}

#[test]
fn test_missing_weeks_are_fetched_on_weekly_bars() {
    let week = 7 * DAY;
    let coverage = vec![
        range(MONDAY, MONDAY + week),
        range(MONDAY + 3 * week, MONDAY + 4 * week),
    ];

    let interior = analyzer().analyze(
        "AAPL",
        Granularity::OneWeek,
        &coverage,
        range(MONDAY, MONDAY + 4 * week),
    );
    assert_eq!(interior, vec![range(MONDAY + week, MONDAY + 3 * week)]);

    // A single missing week between cached ones
    let single = vec![
        range(MONDAY, MONDAY + week),
        range(MONDAY + 2 * week, MONDAY + 3 * week),
    ];
    let gaps = analyzer().analyze(
        "AAPL",
        Granularity::OneWeek,
        &single,
        range(MONDAY, MONDAY + 3 * week),
    );
    assert_eq!(gaps, vec![range(MONDAY + week, MONDAY + 2 * week)]);

    // Leading week ahead of the cache
    let leading = analyzer().analyze(
        "AAPL",
        Granularity::OneWeek,
        &[range(MONDAY + week, MONDAY + 2 * week)],
        range(MONDAY, MONDAY + 2 * week),
    );
    assert_eq!(leading, vec![range(MONDAY, MONDAY + week)]);
}

#[test]
fn test_single_missing_weekday_needs_a_one_day_threshold() {
    let coverage = vec![
        range(MONDAY, MONDAY + 2 * DAY),
        range(MONDAY + 3 * DAY, MONDAY + 4 * DAY),
    ];
    let requested = range(MONDAY, MONDAY + 4 * DAY);

    assert!(analyzer()
        .analyze("AAPL", Granularity::OneDay, &coverage, requested)
        .is_empty());

    let strict = analyzer()
        .with_min_gaps(HashMap::from([(Granularity::OneDay, Duration::from_secs(86_400))]))
        .unwrap();
    assert_eq!(
        strict.analyze("AAPL", Granularity::OneDay, &coverage, requested),
        vec![range(MONDAY + 2 * DAY, MONDAY + 3 * DAY)]
    );
}

#[test]
fn test_min_gap_overrides() {
    let analyzer = analyzer()
        .with_min_gaps(HashMap::from([(
            Granularity::OneHour,
            Duration::from_secs(3_600),
        )]))
        .unwrap();
    assert_eq!(analyzer.min_gap(Granularity::OneHour), Duration::from_secs(3_600));
    assert_eq!(analyzer.min_gap(Granularity::OneDay), Duration::from_secs(2 * 86_400));

    let coverage = vec![
        range(MONDAY, MONDAY + 10 * HOUR),
        range(MONDAY + 13 * HOUR, MONDAY + DAY),
    ];
    let gaps = analyzer.analyze("AAPL", Granularity::OneHour, &coverage, range(MONDAY, MONDAY + DAY));
    assert_eq!(gaps, vec![range(MONDAY + 10 * HOUR, MONDAY + 13 * HOUR)]);

    let zero = GapAnalyzer::new().with_min_gaps(HashMap::from([(Granularity::OneDay, Duration::ZERO)]));
    assert!(zero.is_err());
}

#[test]
fn test_calendar_lookup_ignores_case() {
    let analyzer = analyzer();
    assert_eq!(analyzer.calendar_for("BtcUsd"), TradingCalendar::Continuous);
    assert_eq!(analyzer.calendar_for("AAPL"), TradingCalendar::Weekdays);
}

#[test]
fn test_coverage_difference_clips_to_request() {
    let coverage = vec![
        range(MONDAY - DAY, MONDAY + HOUR),
        range(MONDAY + 5 * HOUR, MONDAY + 6 * HOUR),
        range(MONDAY + 20 * HOUR, MONDAY + 2 * DAY),
    ];
    let missing = missing_from_coverage(&coverage, range(MONDAY, MONDAY + DAY));
    assert_eq!(
        missing,
        vec![
            range(MONDAY + HOUR, MONDAY + 5 * HOUR),
            range(MONDAY + 6 * HOUR, MONDAY + 20 * HOUR),
        ]
    );
}

#[tokio::test]
async fn test_missing_ranges_from_store_contents() {
    let store = MemoryStore::new();
    let mut rows = bars_in(range(MONDAY, MONDAY + DAY), Granularity::OneHour);
    rows.extend(bars_in(range(MONDAY + 3 * DAY, MONDAY + 4 * DAY), Granularity::OneHour));
    store.merge("AAPL", Granularity::OneHour, rows).await.unwrap();

    let gaps = analyzer()
        .find_missing_ranges(&store, "AAPL", Granularity::OneHour, range(MONDAY, SATURDAY))
        .await
        .unwrap();
    assert_eq!(
        gaps,
        vec![
            range(MONDAY + DAY, MONDAY + 3 * DAY),
            range(MONDAY + 4 * DAY, SATURDAY),
        ]
    );

    let empty = analyzer()
        .find_missing_ranges(&store, "MSFT", Granularity::OneHour, range(MONDAY, SATURDAY))
        .await
        .unwrap();
    assert_eq!(empty, vec![range(MONDAY, SATURDAY)]);
}
