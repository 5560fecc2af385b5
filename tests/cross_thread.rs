mod cross_thread {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    use mandelbench::{
        CrossThreadProxy, JobId, JobOutcome, KernelContext, Palette, ProxyCallbacks, RenderJob,
        RenderParams, Strategy, Viewport,
    };

    const WAIT: Duration = Duration::from_secs(120);

    #[derive(Default)]
    struct Seen {
        rows: Vec<(u32, Vec<u8>)>,
        full: Vec<Vec<u8>>,
        finished: Vec<JobId>,
        cancelled: Vec<JobId>,
    }

    fn recorder(seen: &Rc<RefCell<Seen>>) -> ProxyCallbacks {
        let (a, b, c, d) = (
            Rc::clone(seen),
            Rc::clone(seen),
            Rc::clone(seen),
            Rc::clone(seen),
        );
        ProxyCallbacks::new()
            .on_row(move |_, _, row, bytes| a.borrow_mut().rows.push((row, bytes)))
            .on_full_image(move |_, _, frame| b.borrow_mut().full.push(frame))
            .on_finish(move |job| c.borrow_mut().finished.push(job))
            .on_cancel(move |job| d.borrow_mut().cancelled.push(job))
    }

    fn local_frame(strategy: Strategy, p: RenderParams) -> Vec<u8> {
        let mut ctx = KernelContext::new(strategy.descriptor().backend).unwrap();
        ctx.init_canvas(p).unwrap();
        ctx.calculate().unwrap().to_vec()
    }

    #[test]
    fn worker_rows_match_a_local_render() {
        let p = RenderParams::new(24, 18, 64, Viewport::default()).unwrap();
        for strategy in [Strategy::ManagedWorker, Strategy::NativeWorker] {
            let mut proxy = CrossThreadProxy::spawn().unwrap();
            let seen = Rc::new(RefCell::new(Seen::default()));
            let job = RenderJob::new(JobId(3), strategy.descriptor(), p).unwrap();

            let call = proxy.run_line_by_line(&job, recorder(&seen)).unwrap();
            assert_eq!(proxy.wait_job(call, WAIT).unwrap(), JobOutcome::Completed);

            let seen = seen.borrow();
            let order: Vec<u32> = seen.rows.iter().map(|(r, _)| *r).collect();
            assert_eq!(order, (0..18).collect::<Vec<_>>());
            let assembled: Vec<u8> = seen.rows.iter().flat_map(|(_, r)| r.clone()).collect();
            assert_eq!(assembled, local_frame(strategy, p), "{strategy}");
            assert_eq!(seen.finished, vec![JobId(3)]);
            assert!(seen.cancelled.is_empty());
            // Handles are dropped once the call resolves.
            assert_eq!(proxy.live_handles(), 0);
        }
    }

    #[test]
    fn single_pass_frames_are_copied_back() {
        let p = RenderParams::new(16, 12, 32, Viewport::default()).unwrap();
        let mut proxy = CrossThreadProxy::spawn().unwrap();
        let seen = Rc::new(RefCell::new(Seen::default()));
        let job = RenderJob::new(JobId(1), Strategy::ManagedSingle.descriptor(), p).unwrap();

        let call = proxy.run_single(&job, recorder(&seen)).unwrap();
        proxy.wait(call, WAIT).unwrap();

        let seen = seen.borrow();
        assert_eq!(seen.full.len(), 1);
        assert_eq!(seen.full[0], local_frame(Strategy::ManagedSingle, p));
        assert!(seen.rows.is_empty());
        assert_eq!(seen.finished, vec![JobId(1)]);
    }

    #[test]
    fn fire_and_forget_cancel_stops_the_worker_loop() {
        // Heavy enough that the loop is still running when the cancel lands.
        let p = RenderParams::new(256, 2048, 1024, Viewport::default()).unwrap();
        let mut proxy = CrossThreadProxy::spawn().unwrap();
        let seen = Rc::new(RefCell::new(Seen::default()));
        let job = RenderJob::new(JobId(9), Strategy::NativeWorker.descriptor(), p).unwrap();
        let call = proxy.run_line_by_line(&job, recorder(&seen)).unwrap();

        while seen.borrow().rows.is_empty() {
            proxy.pump(WAIT).unwrap();
        }
        proxy.cancel().unwrap();
        proxy.cancel().unwrap();

        assert_eq!(proxy.wait_job(call, WAIT).unwrap(), JobOutcome::Cancelled);
        let seen = seen.borrow();
        assert_eq!(seen.cancelled, vec![JobId(9)]);
        assert!(seen.finished.is_empty());
        assert!(seen.rows.len() < 2048);
        let order: Vec<u32> = seen.rows.iter().map(|(r, _)| *r).collect();
        assert_eq!(order, (0..order.len() as u32).collect::<Vec<_>>());
    }

    #[test]
    fn cancel_hits_the_running_job_not_the_queued_one() {
        let heavy = RenderParams::new(256, 1024, 4096, Viewport::default()).unwrap();
        let light = RenderParams::new(4, 4, 8, Viewport::default()).unwrap();
        let mut proxy = CrossThreadProxy::spawn().unwrap();

        let running = Rc::new(RefCell::new(Seen::default()));
        let queued = Rc::new(RefCell::new(Seen::default()));
        let a = RenderJob::new(JobId(1), Strategy::NativeWorker.descriptor(), heavy).unwrap();
        let b = RenderJob::new(JobId(2), Strategy::NativeWorker.descriptor(), light).unwrap();
        let call_a = proxy.run_line_by_line(&a, recorder(&running)).unwrap();
        let call_b = proxy.run_line_by_line(&b, recorder(&queued)).unwrap();

        while running.borrow().rows.is_empty() {
            proxy.pump(WAIT).unwrap();
        }
        proxy.cancel().unwrap();

        assert_eq!(proxy.wait_job(call_a, WAIT).unwrap(), JobOutcome::Cancelled);
        assert_eq!(proxy.wait_job(call_b, WAIT).unwrap(), JobOutcome::Completed);

        let running = running.borrow();
        assert_eq!(running.cancelled, vec![JobId(1)]);
        assert!(running.finished.is_empty());
        assert!(running.rows.len() < 1024);
        let queued = queued.borrow();
        assert_eq!(queued.rows.len(), 4);
        assert_eq!(queued.finished, vec![JobId(2)]);
        assert!(queued.cancelled.is_empty());
    }

    #[test]
    fn cancel_flag_is_readable_and_reset_per_run() {
        let mut proxy = CrossThreadProxy::spawn().unwrap();
        assert!(!proxy.cancelled(WAIT).unwrap());
        proxy.set_cancelled(true, WAIT).unwrap();
        assert!(proxy.cancelled(WAIT).unwrap());
        assert!(proxy.set_cancelled(false, WAIT).is_err());

        // A new run installs a fresh flag.
        let p = RenderParams::new(4, 4, 8, Viewport::default()).unwrap();
        let job = RenderJob::new(JobId(2), Strategy::ManagedWorker.descriptor(), p).unwrap();
        let call = proxy
            .run_line_by_line(&job, ProxyCallbacks::new())
            .unwrap();
        assert_eq!(proxy.wait_job(call, WAIT).unwrap(), JobOutcome::Completed);
        assert!(!proxy.cancelled(WAIT).unwrap());
    }

    #[test]
    fn construct_and_endpoint_round_trip() {
        let mut proxy = CrossThreadProxy::spawn().unwrap();
        proxy.construct(None, WAIT).unwrap();
        assert_eq!(proxy.remote_endpoint(WAIT).unwrap(), proxy.endpoint());
    }

    #[test]
    fn construct_installs_a_palette_for_later_runs() {
        let p = RenderParams::new(10, 6, 40, Viewport::default()).unwrap();
        let mut proxy = CrossThreadProxy::spawn().unwrap();
        proxy.construct(Some(Palette::Verdant), WAIT).unwrap();

        let seen = Rc::new(RefCell::new(Seen::default()));
        let job = RenderJob::new(JobId(1), Strategy::ManagedWorker.descriptor(), p).unwrap();
        let call = proxy.run_line_by_line(&job, recorder(&seen)).unwrap();
        proxy.wait_job(call, WAIT).unwrap();

        let assembled: Vec<u8> = seen
            .borrow()
            .rows
            .iter()
            .flat_map(|(_, r)| r.clone())
            .collect();
        // Verdant is the native kernel's own palette.
        assert_eq!(assembled, local_frame(Strategy::NativeWorker, p));
    }

    #[test]
    fn invalid_jobs_resolve_with_an_error() {
        let mut proxy = CrossThreadProxy::spawn().unwrap();
        let p = RenderParams::new(4, 4, 8, Viewport::default()).unwrap();
        // The GPU backend has no row loop; the remote executor rejects it.
        let job = RenderJob::new(JobId(1), Strategy::GpuSingle.descriptor(), p).unwrap();
        let call = proxy.run_line_by_line(&job, ProxyCallbacks::new()).unwrap();
        let err = proxy.wait(call, WAIT).unwrap_err();
        assert!(err.to_string().contains("remote call failed"));
        // The binding survives.
        assert!(!proxy.cancelled(WAIT).unwrap());
    }

    #[test]
    fn release_tears_the_binding_down() {
        let mut proxy = CrossThreadProxy::spawn().unwrap();
        let p = RenderParams::new(64, 512, 512, Viewport::default()).unwrap();
        let job = RenderJob::new(JobId(1), Strategy::ManagedWorker.descriptor(), p).unwrap();
        proxy.run_line_by_line(&job, ProxyCallbacks::new()).unwrap();
        proxy.release().unwrap();
        assert!(proxy.is_released());
        assert_eq!(proxy.live_handles(), 0);
        assert!(proxy.run_line_by_line(&job, ProxyCallbacks::new()).is_err());
    }
}
