use procloop::{Loop, LoopAction, LoopError, ProcessStatus, ResolutionMessage, Trigger};
use serial_test::serial;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::process::Command;
use std::time::{Duration, Instant};

fn quick_loop() -> Loop {
    let mut lp = Loop::new(&["root"]).unwrap();
    lp.set_default_timeout(Duration::from_millis(50));
    lp
}

/// Stop the loop no matter what after `secs`
fn deadline(lp: &mut Loop, secs: u64) {
    lp.add_periodic_timer(Duration::from_secs(secs), Some(1), false, |lp| lp.stop());
}

#[test]
#[serial]
fn test_timer_runs_exactly_max_executions() {
    let mut lp = quick_loop();
    let runs = Rc::new(Cell::new(0));
    let counter = runs.clone();
    lp.add_periodic_timer(Duration::from_millis(10), Some(3), true, move |_| {
        counter.set(counter.get() + 1);
    });
    lp.add_periodic_timer(Duration::from_millis(300), Some(1), false, |lp| lp.stop());

    assert_eq!(lp.run().unwrap(), 0);
    assert_eq!(runs.get(), 3);
}

#[test]
#[serial]
fn test_removed_timer_never_fires() {
    let mut lp = quick_loop();
    let fired = Rc::new(Cell::new(false));
    let flag = fired.clone();
    let id = lp.add_periodic_timer(Duration::from_millis(10), None, false, move |_| flag.set(true));
    assert!(lp.remove_timer(id));
    lp.add_periodic_timer(Duration::from_millis(100), Some(1), false, |lp| lp.stop());

    lp.run().unwrap();
    assert!(!fired.get());
}

#[test]
#[serial]
fn test_run_returns_exit_code() {
    let mut lp = quick_loop();
    lp.add_periodic_timer(Duration::from_millis(10), Some(1), true, |lp| {
        lp.set_exit_code(42).unwrap();
        lp.stop();
    });
    assert_eq!(lp.run().unwrap(), 42);
    assert!(!lp.is_running());
}

#[test]
#[serial]
fn test_exit_code_bounds() {
    let mut lp = quick_loop();
    assert!(matches!(lp.set_exit_code(255), Err(LoopError::ExitCode(255))));
    assert!(matches!(lp.set_exit_code(-1), Err(LoopError::ExitCode(-1))));
    lp.set_exit_code(254).unwrap();
    lp.set_exit_code(0).unwrap();
    assert_eq!(lp.exit_code(), 0);
}

#[test]
#[serial]
fn test_before_dispatch_runs_every_turn() {
    let mut lp = quick_loop();
    let turns = Rc::new(Cell::new(0));
    let counter = turns.clone();
    lp.on(Trigger::BeforeDispatch, move |lp, _| {
        counter.set(counter.get() + 1);
        if counter.get() == 3 {
            lp.stop();
        }
    });
    deadline(&mut lp, 5);

    lp.run().unwrap();
    assert_eq!(turns.get(), 3);
}

#[test]
#[serial]
fn test_raised_event_reaches_handler() {
    let mut lp = quick_loop();
    let payloads = Rc::new(RefCell::new(Vec::new()));
    let sink = payloads.clone();
    lp.on(Trigger::InotifyEvent, move |lp, args| {
        sink.borrow_mut().extend(args.events().map(|e| e.to_vec()));
        lp.stop();
    });
    deadline(&mut lp, 5);

    lp.raise(Trigger::InotifyEvent, b"IN_MODIFY /tmp/x".to_vec());
    lp.run().unwrap();
    assert_eq!(*payloads.borrow(), vec![b"IN_MODIFY /tmp/x".to_vec()]);
}

#[test]
#[serial]
fn test_one_shot_action_removed_after_running() {
    let mut lp = quick_loop();
    let runs = Rc::new(Cell::new(0));
    let counter = runs.clone();
    let id = lp.add_action(
        LoopAction::new(Trigger::BeforeDispatch, move |_: &mut Loop, _| {
            counter.set(counter.get() + 1);
        })
        .persistent(false),
    );
    assert!(lp.has_action(id));
    lp.add_periodic_timer(Duration::from_millis(200), Some(1), false, |lp| lp.stop());

    lp.run().unwrap();
    assert_eq!(runs.get(), 1);
    assert!(!lp.has_action(id));
}

#[test]
#[serial]
fn test_shutdown_goes_through_terminated() {
    let mut lp = quick_loop();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    lp.on(Trigger::Terminated, move |_, args| {
        sink.borrow_mut().extend(args.processes().map(|p| p.reason.clone()));
    });
    lp.add_periodic_timer(Duration::from_millis(20), Some(1), false, |lp| {
        lp.shutdown().unwrap();
    });
    deadline(&mut lp, 5);

    lp.run().unwrap();
    assert_eq!(seen.borrow().len(), 1);
    assert!(seen.borrow()[0].contains("SIGTERM"));
    assert_eq!(lp.process().status(), ProcessStatus::Exited);
}

#[test]
#[serial]
fn test_submit_needs_destination() {
    let mut lp = quick_loop();
    assert!(matches!(
        lp.submit(ResolutionMessage::new()),
        Err(LoopError::MissingDestination)
    ));
    // Addressed, but there is nobody to send it to yet
    assert_eq!(lp.submit(ResolutionMessage::to_label("group1", "x")).unwrap(), 0);
}

#[test]
#[serial]
fn test_fork_refused_after_stop() {
    let mut lp = quick_loop();
    lp.stop();
    assert!(matches!(lp.spawn(&["late"]), Err(LoopError::NotRunning)));
    assert_eq!(lp.process().count_children(), 0);
}

#[test]
#[serial]
fn test_standard_descriptors_kept_while_logging() {
    let mut lp = quick_loop();
    lp.set_logging_enabled(true);
    assert!(matches!(
        lp.close_standard_descriptors(),
        Err(LoopError::LoggingEnabled)
    ));
}

#[test]
#[serial]
fn test_process_name() {
    let mut lp = quick_loop();
    lp.set_process_name("procloop-test").unwrap();
    let comm = std::fs::read_to_string("/proc/thread-self/comm").unwrap();
    assert_eq!(comm.trim(), "procloop-test");
}

#[test]
#[serial]
fn test_immediate_action_skips_the_wait() {
    let mut lp = Loop::new(&["root"]).unwrap();
    lp.set_default_timeout(Duration::from_secs(3));
    lp.add_action(
        LoopAction::new(Trigger::EioEvent, |lp: &mut Loop, _| lp.stop()).immediate(true),
    );

    lp.raise(Trigger::EioEvent, b"read done".to_vec());
    let started = Instant::now();
    lp.run().unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
#[serial]
fn test_plain_action_waits_for_the_poll() {
    let mut lp = Loop::new(&["root"]).unwrap();
    lp.set_default_timeout(Duration::from_millis(300));
    lp.on(Trigger::EioEvent, |lp, _| lp.stop());

    lp.raise(Trigger::EioEvent, b"read done".to_vec());
    let started = Instant::now();
    lp.run().unwrap();
    assert!(started.elapsed() >= Duration::from_millis(250));
}

#[test]
#[serial]
fn test_unforked_child_reported_on_exit() {
    let mut lp = quick_loop();
    let child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
    let child_pid = child.id() as i32;

    let reports = Rc::new(RefCell::new(Vec::new()));
    let sink = reports.clone();
    lp.on(Trigger::ChildTerminated, move |lp, args| {
        sink.borrow_mut()
            .extend(args.processes().map(|p| (p.pid, p.exit_code)));
        if sink.borrow().iter().any(|(pid, _)| *pid == child_pid) {
            lp.stop();
        }
    });
    deadline(&mut lp, 5);

    lp.run().unwrap();
    assert!(reports.borrow().contains(&(child_pid, Some(3))));
    assert!(lp.process().child(child_pid).is_none());
}
