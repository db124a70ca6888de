mod common;

use std::time::Duration;

use common::{bench, bench_with, find_event, idle, linear, next_event, settings, to, wait_for};
use mirror_controller::axis::AxisSettings;
use mirror_controller::error::{ConnectError, DispatchError, Rejected, RegistryError, TransportError};
use mirror_controller::event_bus::Event;
use mirror_controller::interlock::{Interlock, InterlockRange};
use mirror_controller::models::{AxisId, AxisStatus, FaultKind, MotionRequest, MotorInfo};
use mirror_controller::session::{SessionHealth, WireCommand};
use mirror_controller::transport::SimulatedChain;

fn move_targets(commands: &[WireCommand]) -> Vec<f64> {
    commands
        .iter()
        .filter_map(|command| match command {
            WireCommand::MoveAbsolute { position, .. } => Some(*position),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn out_of_range_move_never_reaches_the_wire() {
    let chain = SimulatedChain::new();
    let bench = bench(&chain, vec![linear("A", 1, 0.0, 100.0)]).await;
    let axis = AxisId::from("A");
    let before = wait_for(&bench, &axis, idle).await;

    assert_eq!(
        bench.dispatch(&axis, to(150.0)).await,
        Err(DispatchError::Rejected(Rejected::OutOfRange))
    );
    assert_eq!(
        bench
            .dispatch(
                &axis,
                MotionRequest::MoveAbsolute {
                    position: 10.0,
                    speed: Some(25.0),
                },
            )
            .await,
        Err(DispatchError::Rejected(Rejected::OutOfRange))
    );
    assert_eq!(
        bench
            .dispatch(&axis, MotionRequest::SetSpeed { speed: -1.0 })
            .await,
        Err(DispatchError::Rejected(Rejected::OutOfRange))
    );

    tokio::time::sleep(Duration::from_millis(500)).await;
    let after = bench.state(&axis).unwrap();
    assert_eq!(after.position, before.position);
    assert_eq!(after.applied_sequence, before.applied_sequence);
    assert_eq!(after.fault, None);
    assert!(chain.commands_for(1).is_empty());
}

#[tokio::test(start_paused = true)]
async fn move_reports_intermediate_positions_then_completes() {
    let chain = SimulatedChain::new().with_travel_polls(3);
    let bench = bench(&chain, vec![linear("A", 1, 0.0, 100.0)]).await;
    let axis = AxisId::from("A");
    wait_for(&bench, &axis, idle).await;
    let mut events = bench.subscribe();

    let id = bench.dispatch(&axis, to(50.0)).await.unwrap();
    assert_eq!(id.sequence, 1);

    let mut moving = Vec::new();
    let done = loop {
        let state = find_event(&mut events, |event| match event {
            Event::StatusChanged { axis: a, state } if *a == axis => Some(state.clone()),
            _ => None,
        })
        .await;
        if state.moving {
            moving.push(state.position);
        } else if !moving.is_empty() {
            break state;
        }
    };

    assert_eq!(moving.len(), 3, "{moving:?}");
    assert!(moving.windows(2).all(|w| w[0] < w[1]), "{moving:?}");
    assert!((done.position - 50.0).abs() < 1e-9);
    assert_eq!(done.applied_sequence, id.sequence);
    assert_eq!(done.status(), AxisStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn stop_supersedes_every_queued_move() {
    let chain = SimulatedChain::new().with_travel_polls(40);
    let bench = bench(&chain, vec![linear("A", 1, 0.0, 100.0)]).await;
    let axis = AxisId::from("A");
    wait_for(&bench, &axis, idle).await;

    for target in [80.0, 20.0, 60.0] {
        bench.dispatch(&axis, to(target)).await.unwrap();
    }
    wait_for(&bench, &axis, |s| s.moving).await;

    let stop = bench.cancel(&axis).await.unwrap();
    assert_eq!(stop.sequence, 4);
    wait_for(&bench, &axis, |s| s.applied_sequence == 4 && !s.moving).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    let commands = chain.commands_for(1);
    assert_eq!(move_targets(&commands), vec![80.0]);
    assert_eq!(commands.last(), Some(&WireCommand::Stop));

    let state = bench.state(&axis).unwrap();
    assert_eq!(state.applied_sequence, 4);
    assert!(state.position > 0.0 && state.position < 80.0, "{}", state.position);
}

#[tokio::test(start_paused = true)]
async fn stop_before_the_first_ack_still_wins() {
    let chain = SimulatedChain::new()
        .with_travel_polls(5)
        .with_io_latency(Duration::from_millis(20));
    let bench = bench(&chain, vec![linear("A", 1, 0.0, 100.0)]).await;
    let axis = AxisId::from("A");
    wait_for(&bench, &axis, idle).await;
    let mut events = bench.subscribe();

    for target in [80.0, 20.0, 60.0] {
        bench.dispatch(&axis, MotionRequest::MoveAbsolute { position: target, speed: None })
            .await
            .unwrap();
    }
    bench.dispatch(&axis, MotionRequest::Stop).await.unwrap();

    wait_for(&bench, &axis, |s| s.applied_sequence == 4 && idle(s)).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let commands = chain.commands_for(1);
    assert_eq!(move_targets(&commands), vec![80.0]);
    assert_eq!(commands.last(), Some(&WireCommand::Stop));

    while let Some(event) = events.try_recv() {
        if let Event::StatusChanged { state, .. } = event {
            assert!(
                state.applied_sequence == 0 || state.applied_sequence == 4,
                "superseded command applied: {}",
                state.applied_sequence
            );
        }
    }
}

#[tokio::test(start_paused = true)]
async fn stop_goes_on_the_wire_before_pending_settings() {
    let chain = SimulatedChain::new().with_travel_polls(40);
    let bench = bench(&chain, vec![linear("A", 1, 0.0, 100.0)]).await;
    let axis = AxisId::from("A");
    wait_for(&bench, &axis, idle).await;

    bench.dispatch(&axis, to(80.0)).await.unwrap();
    wait_for(&bench, &axis, |s| s.moving).await;
    bench
        .dispatch(&axis, MotionRequest::SetSpeed { speed: 5.0 })
        .await
        .unwrap();
    bench.cancel(&axis).await.unwrap();

    wait_for(&bench, &axis, |s| s.applied_sequence == 3 && !s.moving).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(
        chain.commands_for(1),
        vec![
            WireCommand::MoveAbsolute {
                position: 80.0,
                speed: Some(10.0),
            },
            WireCommand::Stop,
            WireCommand::SetSpeed { speed: 5.0 },
        ]
    );
    assert_eq!(chain.speed(1), Some(5.0));
}

#[tokio::test(start_paused = true)]
async fn relative_moves_build_on_the_planned_target() {
    let chain = SimulatedChain::new();
    let bench = bench(&chain, vec![linear("A", 1, 0.0, 100.0)]).await;
    let axis = AxisId::from("A");
    wait_for(&bench, &axis, idle).await;

    let relative = |distance| MotionRequest::MoveRelative {
        distance,
        speed: None,
    };
    bench.dispatch(&axis, relative(10.0)).await.unwrap();
    bench.dispatch(&axis, relative(10.0)).await.unwrap();
    assert_eq!(
        bench.dispatch(&axis, relative(-50.0)).await,
        Err(DispatchError::Rejected(Rejected::OutOfRange))
    );

    let state = wait_for(&bench, &axis, |s| s.applied_sequence == 2 && idle(s)).await;
    assert!((state.position - 20.0).abs() < 1e-9);
    assert_eq!(move_targets(&chain.commands_for(1)), vec![10.0, 20.0]);
}

#[tokio::test(start_paused = true)]
async fn set_speed_is_used_by_later_moves() {
    let chain = SimulatedChain::new();
    let bench = bench(&chain, vec![linear("A", 1, 0.0, 100.0)]).await;
    let axis = AxisId::from("A");
    wait_for(&bench, &axis, idle).await;

    assert_eq!(
        bench
            .dispatch(&axis, MotionRequest::SetSpeed { speed: 50.0 })
            .await,
        Err(DispatchError::Rejected(Rejected::OutOfRange))
    );
    bench
        .dispatch(&axis, MotionRequest::SetSpeed { speed: 5.0 })
        .await
        .unwrap();
    bench.dispatch(&axis, to(30.0)).await.unwrap();
    wait_for(&bench, &axis, |s| s.applied_sequence == 2 && idle(s)).await;

    assert_eq!(chain.speed(1), Some(5.0));
    assert_eq!(
        chain.commands_for(1),
        vec![
            WireCommand::SetSpeed { speed: 5.0 },
            WireCommand::MoveAbsolute {
                position: 30.0,
                speed: None,
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn out_of_limits_fault_blocks_motion_until_homed() {
    let chain = SimulatedChain::new();
    let bench = bench(&chain, vec![linear("A", 1, 0.0, 100.0)]).await;
    let axis = AxisId::from("A");
    wait_for(&bench, &axis, idle).await;
    let mut events = bench.subscribe();

    chain.set_position(1, 150.0);
    let fault = find_event(&mut events, |event| match event {
        Event::AxisFault { fault, .. } => Some(*fault),
        _ => None,
    })
    .await;
    assert_eq!(fault, FaultKind::OutOfLimits);
    assert_eq!(bench.state(&axis).unwrap().status(), AxisStatus::Faulted);

    assert_eq!(
        bench.dispatch(&axis, to(10.0)).await,
        Err(DispatchError::Rejected(Rejected::AxisFaulted))
    );

    bench.dispatch(&axis, MotionRequest::Home).await.unwrap();
    let homed = wait_for(&bench, &axis, |s| s.homed && idle(s)).await;
    assert_eq!(homed.position, 0.0);

    bench.dispatch(&axis, to(10.0)).await.unwrap();
    wait_for(&bench, &axis, |s| s.applied_sequence == 3 && idle(s)).await;
}

#[tokio::test(start_paused = true)]
async fn home_recovers_an_axis_whose_limits_exclude_zero() {
    let chain = SimulatedChain::new().with_device(1, 50.0);
    let motor = MotorInfo {
        home_position: 10.0,
        ..linear("A", 1, 10.0, 100.0)
    };
    let bench = bench(&chain, vec![motor]).await;
    let axis = AxisId::from("A");
    wait_for(&bench, &axis, idle).await;

    chain.set_position(1, 150.0);
    let faulted = wait_for(&bench, &axis, |s| s.fault.is_some()).await;
    assert_eq!(faulted.fault, Some(FaultKind::OutOfLimits));

    bench.dispatch(&axis, MotionRequest::Home).await.unwrap();
    let homed = wait_for(&bench, &axis, |s| s.homed && idle(s)).await;
    assert_eq!(homed.applied_sequence, 1);
    assert!((homed.position - 10.0).abs() < 1e-9);

    // the device zero is passed on the way, the home position is where it ends
    let commands = chain.commands_for(1);
    assert_eq!(commands.first(), Some(&WireCommand::Home));
    assert_eq!(move_targets(&commands), vec![10.0]);
    assert!(!commands.contains(&WireCommand::Stop));

    bench.dispatch(&axis, to(40.0)).await.unwrap();
    wait_for(&bench, &axis, |s| s.applied_sequence == 2 && idle(s)).await;
}

#[tokio::test(start_paused = true)]
async fn protocol_error_latches_a_fault_and_drops_the_queue() {
    let chain = SimulatedChain::new().with_io_latency(Duration::from_millis(20));
    let bench = bench(&chain, vec![linear("A", 1, 0.0, 100.0)]).await;
    let axis = AxisId::from("A");
    wait_for(&bench, &axis, idle).await;
    let mut events = bench.subscribe();

    chain.fail_commands(TransportError::ProtocolError, 1);
    bench.dispatch(&axis, to(30.0)).await.unwrap();
    bench.dispatch(&axis, to(60.0)).await.unwrap();

    let fault = find_event(&mut events, |event| match event {
        Event::AxisFault { fault, .. } => Some(*fault),
        _ => None,
    })
    .await;
    assert_eq!(fault, FaultKind::Protocol);

    let mut session = bench.watch_session(common::PORT).unwrap();
    session
        .wait_for(|health| *health == SessionHealth::Connected)
        .await
        .unwrap();
    assert_eq!(
        bench.dispatch(&axis, to(10.0)).await,
        Err(DispatchError::Rejected(Rejected::AxisFaulted))
    );

    bench.dispatch(&axis, MotionRequest::Home).await.unwrap();
    let homed = wait_for(&bench, &axis, |s| s.homed && idle(s)).await;
    assert_eq!(homed.applied_sequence, 4);

    // the queued move to 60 never reached the wire
    let commands = chain.commands_for(1);
    assert_eq!(move_targets(&commands), vec![30.0]);
    assert_eq!(commands.last(), Some(&WireCommand::Home));
}

#[tokio::test(start_paused = true)]
async fn hardware_fault_stops_a_running_move() {
    let chain = SimulatedChain::new().with_travel_polls(40);
    let bench = bench(&chain, vec![linear("A", 1, 0.0, 100.0)]).await;
    let axis = AxisId::from("A");
    wait_for(&bench, &axis, idle).await;

    bench.dispatch(&axis, to(90.0)).await.unwrap();
    bench.dispatch(&axis, to(10.0)).await.unwrap();
    wait_for(&bench, &axis, |s| s.moving).await;

    chain.set_fault(1, true);
    let faulted = wait_for(&bench, &axis, |s| s.fault.is_some()).await;
    assert_eq!(faulted.fault, Some(FaultKind::Hardware));
    wait_for(&bench, &axis, |s| !s.moving).await;

    tokio::time::sleep(Duration::from_secs(3)).await;
    let commands = chain.commands_for(1);
    assert_eq!(move_targets(&commands), vec![90.0]);
    assert_eq!(commands.last(), Some(&WireCommand::Stop));
    assert_eq!(bench.state(&axis).unwrap().applied_sequence, 0);
}

#[tokio::test(start_paused = true)]
async fn poll_timeouts_make_state_stale_until_polling_recovers() {
    let chain = SimulatedChain::new();
    let bench = bench(&chain, vec![linear("A", 1, 0.0, 100.0)]).await;
    let axis = AxisId::from("A");
    bench.dispatch(&axis, to(42.0)).await.unwrap();
    let good = wait_for(&bench, &axis, |s| s.applied_sequence == 1 && idle(s)).await;
    let mut events = bench.subscribe();

    chain.fail_polls(TransportError::Timeout, 3);

    let mut health = Vec::new();
    let stale = loop {
        match next_event(&mut events).await {
            Event::SessionHealthChanged { health: h, .. } => health.push(h),
            Event::StatusChanged { state, .. } if state.stale => break state,
            _ => {}
        }
    };
    assert_eq!(stale.last_error, Some(TransportError::Timeout));
    assert_eq!(stale.position, good.position);
    assert_eq!(stale.status(), AxisStatus::Stale);
    assert_eq!(
        health,
        vec![SessionHealth::Disconnected, SessionHealth::Reconnecting]
    );

    let fresh = wait_for(&bench, &axis, |s| !s.stale).await;
    assert!(fresh.last_updated > stale.last_updated);
    assert_eq!(fresh.last_error, None);
    assert!((fresh.position - 42.0).abs() < 1e-9);
    assert_eq!(bench.session_health(common::PORT), Some(SessionHealth::Connected));
}

#[tokio::test(start_paused = true)]
async fn two_axes_share_one_serialized_session() {
    let chain = SimulatedChain::new()
        .with_travel_polls(2)
        .with_io_latency(Duration::from_millis(5));
    let bench = bench(
        &chain,
        vec![linear("A", 1, 0.0, 100.0), linear("B", 2, 0.0, 100.0)],
    )
    .await;
    let (a, b) = (AxisId::from("A"), AxisId::from("B"));
    wait_for(&bench, &a, idle).await;
    wait_for(&bench, &b, idle).await;

    let drive = |axis: AxisId, targets: [f64; 3]| {
        let bench = &bench;
        async move {
            for target in targets {
                bench.dispatch(&axis, to(target)).await.unwrap();
            }
        }
    };
    tokio::join!(
        drive(a.clone(), [10.0, 20.0, 30.0]),
        drive(b.clone(), [15.0, 25.0, 35.0])
    );

    wait_for(&bench, &a, |s| s.applied_sequence == 3 && idle(s)).await;
    wait_for(&bench, &b, |s| s.applied_sequence == 3 && idle(s)).await;

    let log = chain.wire_log();
    for pair in log.windows(2) {
        assert!(pair[1].started >= pair[0].finished, "overlapping exchanges");
    }
    assert_eq!(move_targets(&chain.commands_for(1)), vec![10.0, 20.0, 30.0]);
    assert_eq!(move_targets(&chain.commands_for(2)), vec![15.0, 25.0, 35.0]);
}

#[tokio::test(start_paused = true)]
async fn requests_fail_fast_while_the_session_is_down() {
    let chain = SimulatedChain::new();
    chain.fail_connects(ConnectError::PortBusy, 1000);
    let bench = bench(&chain, vec![linear("A", 1, 0.0, 100.0)]).await;
    let axis = AxisId::from("A");

    assert_eq!(
        bench.session_health(common::PORT),
        Some(SessionHealth::Reconnecting)
    );
    assert_eq!(
        bench.dispatch(&axis, to(10.0)).await,
        Err(DispatchError::SessionDown)
    );
    assert_eq!(bench.cancel(&axis).await, Err(DispatchError::SessionDown));
    assert_eq!(
        bench.dispatch(&AxisId::from("nope"), to(1.0)).await,
        Err(DispatchError::UnknownAxis)
    );

    let state = wait_for(&bench, &axis, |s| s.last_error.is_some()).await;
    assert_eq!(state.last_error, Some(TransportError::Disconnected));
    assert_eq!(state.status(), AxisStatus::Stale);
}

#[tokio::test(start_paused = true)]
async fn overrunning_moves_are_abandoned_and_stopped() {
    let chain = SimulatedChain::new().with_travel_polls(200);
    let mut settings = settings();
    settings.axis = AxisSettings {
        motion_time_limit: Duration::from_secs(1),
    };
    let bench = bench_with(&chain, vec![linear("A", 1, 0.0, 100.0)], settings).await;
    let axis = AxisId::from("A");
    wait_for(&bench, &axis, idle).await;

    bench.dispatch(&axis, to(90.0)).await.unwrap();
    bench.dispatch(&axis, to(5.0)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(4)).await;

    // each move overruns in turn and is followed by its own Stop
    let commands = chain.commands_for(1);
    assert_eq!(move_targets(&commands), vec![90.0, 5.0]);
    assert_eq!(
        commands
            .iter()
            .filter(|command| **command == WireCommand::Stop)
            .count(),
        2
    );
    let state = bench.state(&axis).unwrap();
    assert_eq!(state.applied_sequence, 0);
    assert!(!state.moving);
}

#[tokio::test(start_paused = true)]
async fn axes_can_be_added_and_removed_at_runtime() {
    let chain = SimulatedChain::new();
    let bench = bench(&chain, vec![linear("A", 1, 0.0, 100.0)]).await;
    let (a, c) = (AxisId::from("A"), AxisId::from("C"));

    assert_eq!(
        bench.add_axis(linear("A", 5, 0.0, 10.0)),
        Err(RegistryError::DuplicateAxis(a.clone()))
    );
    bench.add_axis(linear("C", 3, -10.0, 10.0)).unwrap();
    wait_for(&bench, &c, idle).await;
    bench.dispatch(&c, to(-5.0)).await.unwrap();
    wait_for(&bench, &c, |s| s.applied_sequence == 1 && idle(s)).await;

    let ids: Vec<_> = bench.motors().iter().map(|m| m.id.clone()).collect();
    assert_eq!(ids, vec![a.clone(), c.clone()]);

    let removed = bench.remove_axis(&a).await.unwrap();
    assert_eq!(removed.device, 1);
    assert_eq!(bench.state(&a), Err(DispatchError::UnknownAxis));
    assert_eq!(bench.dispatch(&a, to(1.0)).await, Err(DispatchError::UnknownAxis));
    assert_eq!(bench.states().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn interlocks_match_current_positions() {
    let chain = SimulatedChain::new();
    let mut settings = settings();
    settings.interlocks = vec![Interlock {
        label: "mirrors crossed".to_string(),
        description: "A inserted while B retracted".to_string(),
        ranges: vec![
            InterlockRange {
                axis: AxisId::from("A"),
                min: Some(40.0),
                max: None,
            },
            InterlockRange {
                axis: AxisId::from("B"),
                min: None,
                max: Some(10.0),
            },
        ],
    }];
    let bench = bench_with(
        &chain,
        vec![linear("A", 1, 0.0, 100.0), linear("B", 2, 0.0, 100.0)],
        settings,
    )
    .await;
    let (a, b) = (AxisId::from("A"), AxisId::from("B"));
    wait_for(&bench, &a, idle).await;
    wait_for(&bench, &b, idle).await;
    assert!(bench.interlock_matches().is_empty());

    bench.dispatch(&a, to(50.0)).await.unwrap();
    wait_for(&bench, &a, |s| s.applied_sequence == 1 && idle(s)).await;
    let matched = bench.interlock_matches();
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].label, "mirrors crossed");

    bench.dispatch(&b, to(20.0)).await.unwrap();
    wait_for(&bench, &b, |s| s.applied_sequence == 1 && idle(s)).await;
    assert!(bench.interlock_matches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn interlocks_ignore_axes_never_polled() {
    let chain = SimulatedChain::new();
    chain.fail_connects(ConnectError::PortBusy, 1000);
    let mut settings = settings();
    settings.interlocks = vec![Interlock {
        label: "A parked".to_string(),
        description: String::new(),
        ranges: vec![InterlockRange {
            axis: AxisId::from("A"),
            min: None,
            max: Some(5.0),
        }],
    }];
    let bench = bench_with(&chain, vec![linear("A", 1, 0.0, 100.0)], settings).await;
    let axis = AxisId::from("A");

    tokio::time::sleep(Duration::from_secs(2)).await;
    let state = bench.state(&axis).unwrap();
    assert_eq!(state.last_updated, None);
    assert_eq!(state.position, 0.0);
    assert!(bench.positions().is_empty());
    assert!(bench.interlock_matches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn discovery_lists_devices_on_the_chain() {
    let chain = SimulatedChain::new()
        .with_device(1, 0.0)
        .with_device(7, 3.0);
    let bench = bench(&chain, vec![linear("A", 1, 0.0, 100.0)]).await;

    let devices: Vec<u8> = bench
        .discover(common::PORT)
        .await
        .unwrap()
        .iter()
        .map(|device| device.device)
        .collect();
    assert_eq!(devices, vec![1, 7]);
    assert_eq!(
        bench.discover("elsewhere").await,
        Err(TransportError::Disconnected)
    );
}
