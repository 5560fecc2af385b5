#[cfg(feature = "gpu")]
mod gpu_smoke {
    use mandelbench::{
        GpuAdapterState, GpuKernelAdapter, JobId, JobOutcome, RenderCallbacks, RenderJob,
        RenderParams, Strategy, StrategyExecutor, ThreadYield, Viewport,
    };

    #[test]
    fn gpu_frame_has_the_expected_shape() {
        let mut gpu = GpuKernelAdapter::new();
        match gpu.configure(40, 30) {
            Ok(()) => {}
            Err(e) if e.to_string().contains("no gpu adapter available") => return,
            Err(e) => panic!("unexpected gpu configure error: {e}"),
        }
        assert_eq!(
            gpu.state(),
            GpuAdapterState::Configured {
                width: 40,
                height: 30
            }
        );

        let frame = gpu.submit(256, Viewport::default()).unwrap();
        assert_eq!(frame.len(), 40 * 30 * 4);
        assert!(frame.chunks_exact(4).all(|px| px[3] == 255));
        // Pixels inside the set never escape and stay black.
        assert!(frame.chunks_exact(4).any(|px| px[..3] == [0, 0, 0]));

        // Same size again reuses the pipeline.
        gpu.configure(40, 30).unwrap();
        assert_eq!(gpu.submit(256, Viewport::default()).unwrap(), frame);
    }

    #[derive(Default)]
    struct Frames(Vec<Vec<u8>>, usize);

    impl RenderCallbacks for Frames {
        fn on_row(
            &mut self,
            _job: JobId,
            _started_at: std::time::Instant,
            _row: u32,
            _bytes: std::borrow::Cow<'_, [u8]>,
        ) -> mandelbench::MandelResult<()> {
            panic!("single-pass runs deliver no rows");
        }

        fn on_full_image(
            &mut self,
            _job: JobId,
            _started_at: std::time::Instant,
            frame: std::borrow::Cow<'_, [u8]>,
        ) -> mandelbench::MandelResult<()> {
            self.0.push(frame.into_owned());
            Ok(())
        }

        fn on_finish(&mut self, _job: JobId) -> mandelbench::MandelResult<()> {
            self.1 += 1;
            Ok(())
        }

        fn on_cancel(&mut self, _job: JobId) -> mandelbench::MandelResult<()> {
            panic!("gpu runs cannot be cancelled");
        }
    }

    #[test]
    fn gpu_strategy_runs_through_the_executor() {
        if !mandelbench::gpu::is_available() {
            return;
        }
        let p = RenderParams::new(16, 16, 64, Viewport::default()).unwrap();
        let job = RenderJob::new(JobId(1), Strategy::GpuSingle.descriptor(), p).unwrap();
        let mut cb = Frames::default();
        let out = StrategyExecutor::new()
            .execute(&job, &mut cb, &mut ThreadYield)
            .unwrap();
        assert_eq!(out, JobOutcome::Completed);
        assert_eq!(cb.0.len(), 1);
        assert_eq!(cb.0[0].len(), 16 * 16 * 4);
        assert_eq!(cb.1, 1);
    }
}
