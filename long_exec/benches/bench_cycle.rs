//! # Control Cycle Benchmark

use chrono::{Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use long_lib::{
    loc::Odometry,
    long_ctrl::{InputData, LongCtrl, Params},
    sim_vehicle::{approach_trajectory, SimVehicle},
};
use util::module::State;

fn control_cycle_benchmark(c: &mut Criterion) {
    // ---- Controller driving along the default approach ----

    let params = Params::default();
    let period_ms = (params.ctrl_period_s * 1000.0).round() as i64;

    let mut ctrl = LongCtrl::new(params.clone()).unwrap();
    let points = approach_trajectory(200.0, 3.0, 0.5, 0.5);
    let mut vehicle = SimVehicle::new(points[0].pose, 0.2, 0.1);
    ctrl.set_trajectory(points).unwrap();

    let mut now = Utc::now();

    // Warm up into the drive state with a full command history
    for _ in 0..100 {
        now = now + Duration::milliseconds(period_ms);
        let input = InputData {
            now,
            trajectory: None,
            odometry: Some(Odometry { stamp: now, speed_ms: vehicle.speed_ms() }),
            pose: Some(vehicle.pose()),
            is_steer_converged: true,
        };
        if let Some(cmd) = ctrl.proc(&input).unwrap().0 {
            vehicle.step(&cmd, params.ctrl_period_s);
        }
    }

    // ---- Benchmark ----

    c.bench_function("long_ctrl cycle", |b| {
        b.iter(|| {
            now = now + Duration::milliseconds(period_ms);
            let input = InputData {
                now,
                trajectory: None,
                odometry: Some(Odometry { stamp: now, speed_ms: vehicle.speed_ms() }),
                pose: Some(vehicle.pose()),
                is_steer_converged: true,
            };
            black_box(ctrl.proc(&input).unwrap());
        })
    });
}

criterion_group!(benches, control_cycle_benchmark);
criterion_main!(benches);
