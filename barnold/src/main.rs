// Render worker process: owns the renderer instance for one interactive
// preview session. The controller launches this binary with the session's
// resources on the command line, feeds scene deltas through stdin, and
// reads redraw wakes from stdout, which is why all logging goes to stderr.
use anyhow::Context;
use arnold::PreviewRenderer;
use barnold_lib::services::channel::ControlReceiver;
use barnold_lib::services::frame_buffer::FrameBufferDescriptor;
use barnold_lib::services::redraw::RedrawSignal;
use barnold_lib::services::worker::{Worker, WorkerConfig};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "barnold-worker")]
struct Cli {
    /// Session identifier shared with the controller.
    #[arg(long)]
    session: Uuid,
    /// Name of the shared frame-buffer region to attach to.
    #[arg(long)]
    buffer: String,
    #[arg(long)]
    width: u32,
    #[arg(long)]
    height: u32,
    /// First level of the progressive refinement ramp.
    #[arg(long, default_value_t = -3, allow_negative_numbers = true)]
    initial_level: i32,
    /// Final sampling quality; the options delta can retune it.
    #[arg(long, default_value_t = 4, allow_negative_numbers = true)]
    aa_samples: i32,
}

fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    let config = WorkerConfig {
        session: cli.session,
        buffer: FrameBufferDescriptor {
            name: cli.buffer,
            width: cli.width,
            height: cli.height,
        },
        initial_sampling_level: cli.initial_level,
        aa_samples: cli.aa_samples,
    };

    let mut renderer = PreviewRenderer::new();
    let channel = ControlReceiver::spawn(std::io::stdin());
    let signal = RedrawSignal::new(std::io::stdout());

    let worker = Worker::new(&mut renderer, channel, signal, config)
        .context("unable to attach to session resources")?;
    // a fatal renderer error propagates out and exits non-zero, which is
    // how the controller learns about it when joining
    worker.run().context("render worker failed")?;
    Ok(())
}
