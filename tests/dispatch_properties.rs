//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Property and scenario suites for dispatch planning."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Hard-bound properties of the dispatch optimizer under adversarial input.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use mg_ems_common::config::SourceKind;
use mg_ems_dispatch::constraints::advance_soc;
use mg_ems_dispatch::{BatterySpec, DispatchConstraints, MeritOrderOptimizer, SourceSpec};
use mg_ems_estimator::SystemState;
use mg_ems_forecast::{DerivationTag, ForecastBucket, ForecastWindow};
use mg_ems_telemetry::QuantityKind;

const EPS: f64 = 1e-6;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
}

fn state() -> SystemState {
    SystemState {
        timestamp: t0(),
        soc: IndexMap::new(),
        soc_confidence: IndexMap::new(),
        available_kw: IndexMap::new(),
        last_integrated_cycle: None,
        last_applied: None,
        missing_sources: Vec::new(),
    }
}

fn window(kind: QuantityKind, values: &[f64]) -> ForecastWindow {
    ForecastWindow {
        kind,
        bucket: Duration::from_secs(900),
        buckets: values
            .iter()
            .enumerate()
            .map(|(i, kw)| ForecastBucket {
                start: t0() + chrono::TimeDelta::minutes(15 * i as i64),
                point_kw: *kw,
                lower_kw: *kw,
                upper_kw: *kw,
            })
            .collect(),
        naive: false,
        derived_from: DerivationTag {
            state_timestamp: t0(),
            window_start: None,
            window_end: None,
            sample_count: 0,
            strategy: "test".into(),
        },
    }
}

fn random_constraints(rng: &mut StdRng) -> DispatchConstraints {
    let mut sources = IndexMap::new();
    sources.insert(
        "grid".to_owned(),
        SourceSpec {
            kind: SourceKind::Grid,
            available_kw: rng.gen_range(10.0..60.0),
            ramp_kw: rng.gen_range(5.0..50.0),
            cost_per_kwh: rng.gen_range(0.1..0.5),
            previous_allocation_kw: 0.0,
            battery: None,
        },
    );
    let battery_capacity_kw = rng.gen_range(2.0..8.0);
    sources.insert(
        "battery".to_owned(),
        SourceSpec {
            kind: SourceKind::Battery,
            available_kw: battery_capacity_kw,
            ramp_kw: rng.gen_range(1.0..5.0),
            cost_per_kwh: rng.gen_range(0.01..0.2),
            previous_allocation_kw: 0.0,
            battery: Some(BatterySpec {
                capacity_kwh: rng.gen_range(5.0..20.0),
                min_soc: 0.1,
                max_soc: 0.95,
                round_trip_efficiency: rng.gen_range(0.8..0.98),
                max_charge_kw: rng.gen_range(1.0..5.0),
                soc: rng.gen_range(0.1..0.95),
            }),
        },
    );
    let solar_kw = rng.gen_range(0.0..10.0);
    sources.insert(
        "solar".to_owned(),
        SourceSpec {
            kind: SourceKind::Renewable,
            available_kw: solar_kw,
            ramp_kw: solar_kw.max(1.0),
            cost_per_kwh: 0.0,
            previous_allocation_kw: 0.0,
            battery: None,
        },
    );
    DispatchConstraints {
        bucket: Duration::from_secs(900),
        renewable_credit_per_kwh: rng.gen_range(0.0..0.1),
        sources,
    }
}

/// Capacity, ramp, and SOC bounds hold for every plan the optimizer can be
/// provoked into producing, including under demand spikes far beyond total
/// capacity.
#[test]
fn hard_bounds_survive_adversarial_demand() {
    let mut rng = StdRng::seed_from_u64(0xA11CE);
    let optimizer = MeritOrderOptimizer::new();

    for trial in 0..200 {
        let constraints = random_constraints(&mut rng);
        let buckets = 8;
        let demand: Vec<f64> = (0..buckets)
            .map(|_| {
                if rng.gen_bool(0.3) {
                    rng.gen_range(100.0..500.0)
                } else {
                    rng.gen_range(0.0..20.0)
                }
            })
            .collect();
        let generation: Vec<f64> = (0..buckets).map(|_| rng.gen_range(0.0..10.0)).collect();

        let plan = optimizer
            .optimize(
                &state(),
                &window(QuantityKind::Load, &demand),
                &window(QuantityKind::Generation, &generation),
                &constraints,
                trial,
                None,
            )
            .unwrap();

        for (source_id, spec) in &constraints.sources {
            let mut previous = spec.previous_allocation_kw;
            let mut soc = spec.battery.as_ref().map(|b| b.soc);
            for step in &plan.steps {
                let alloc = step.allocation_of(source_id);
                assert!(
                    alloc <= spec.available_kw + EPS,
                    "trial {}: {} exceeds capacity",
                    trial,
                    source_id
                );
                assert!(
                    (alloc - previous).abs() <= spec.ramp_kw + EPS,
                    "trial {}: {} exceeds ramp",
                    trial,
                    source_id
                );
                match &spec.battery {
                    Some(battery) => {
                        assert!(alloc >= -battery.max_charge_kw - EPS);
                        let next = advance_soc(
                            battery,
                            soc.take().unwrap(),
                            alloc,
                            constraints.bucket_hours(),
                        );
                        assert!(
                            next >= battery.min_soc - EPS && next <= battery.max_soc + EPS,
                            "trial {}: SOC trajectory out of bounds",
                            trial
                        );
                        soc = Some(next);
                    }
                    None => assert!(alloc >= -EPS),
                }
                previous = alloc;
            }
        }
    }
}

/// Demand exactly equal to total dispatchable capacity: covered with zero
/// shortfall and zero slack.
#[test]
fn exact_capacity_boundary_has_no_shortfall_and_no_slack() {
    let mut sources = IndexMap::new();
    sources.insert(
        "grid".to_owned(),
        SourceSpec {
            kind: SourceKind::Grid,
            available_kw: 5.0,
            ramp_kw: 5.0,
            cost_per_kwh: 0.30,
            previous_allocation_kw: 0.0,
            battery: None,
        },
    );
    let constraints = DispatchConstraints {
        bucket: Duration::from_secs(900),
        renewable_credit_per_kwh: 0.0,
        sources,
    };
    let optimizer = MeritOrderOptimizer::new();
    let plan = optimizer
        .optimize(
            &state(),
            &window(QuantityKind::Load, &[5.0, 5.0, 5.0, 5.0]),
            &window(QuantityKind::Generation, &[0.0, 0.0, 0.0, 0.0]),
            &constraints,
            1,
            None,
        )
        .unwrap();
    for step in &plan.steps {
        assert!((step.allocation_of("grid") - 5.0).abs() < EPS);
        assert_eq!(step.shortfall_kw, 0.0);
        assert_eq!(step.surplus_kw, 0.0);
    }
}

/// Night scenario from the acceptance sheet: grid + half-charged 10 kWh
/// battery + dark solar against a flat 5 kW demand across four 15-minute
/// buckets. The battery leads up to its ramp limit, the remainder imports,
/// solar stays at zero.
#[test]
fn night_battery_first_scenario() {
    let mut sources = IndexMap::new();
    sources.insert(
        "grid".to_owned(),
        SourceSpec {
            kind: SourceKind::Grid,
            available_kw: 50.0,
            ramp_kw: 50.0,
            cost_per_kwh: 0.30,
            previous_allocation_kw: 0.0,
            battery: None,
        },
    );
    sources.insert(
        "battery".to_owned(),
        SourceSpec {
            kind: SourceKind::Battery,
            available_kw: 5.0,
            ramp_kw: 2.5,
            cost_per_kwh: 0.05,
            previous_allocation_kw: 0.0,
            battery: Some(BatterySpec {
                capacity_kwh: 10.0,
                min_soc: 0.1,
                max_soc: 0.95,
                round_trip_efficiency: 0.92,
                max_charge_kw: 4.0,
                soc: 0.5,
            }),
        },
    );
    sources.insert(
        "solar".to_owned(),
        SourceSpec {
            kind: SourceKind::Renewable,
            available_kw: 8.0,
            ramp_kw: 8.0,
            cost_per_kwh: 0.0,
            previous_allocation_kw: 0.0,
            battery: None,
        },
    );
    let constraints = DispatchConstraints {
        bucket: Duration::from_secs(900),
        renewable_credit_per_kwh: 0.02,
        sources,
    };

    let optimizer = MeritOrderOptimizer::new();
    let plan = optimizer
        .optimize(
            &state(),
            &window(QuantityKind::Load, &[5.0; 4]),
            &window(QuantityKind::Generation, &[0.0; 4]),
            &constraints,
            1,
            None,
        )
        .unwrap();

    assert!(!plan.has_shortfall());
    for step in &plan.steps {
        assert_eq!(step.allocation_of("solar"), 0.0);
        assert!((step.allocation_of("battery") + step.allocation_of("grid") - 5.0).abs() < EPS);
    }
    assert!((plan.steps[0].allocation_of("battery") - 2.5).abs() < EPS);
    assert!((plan.steps[0].allocation_of("grid") - 2.5).abs() < EPS);
    assert!(plan.steps[1].allocation_of("battery") > plan.steps[0].allocation_of("battery"));
}
