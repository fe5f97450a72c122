// Version information constants
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

use clap::{Parser, Subcommand};
use std::error::Error;
use std::io::{BufWriter, Write};

mod cluster;
mod error;
mod matrix;
mod progress;
mod render;
mod scale;

/// Logger manager supporting dynamic progress display and detailed logging
pub struct Logger {
    writer: BufWriter<std::fs::File>,
    last_progress: String,
}

impl Logger {
    pub fn new(file: std::fs::File) -> Self {
        Self {
            writer: BufWriter::new(file),
            last_progress: String::new(),
        }
    }

    /// Record detailed log information
    pub fn log(&mut self, message: &str) -> std::io::Result<()> {
        let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S");
        writeln!(self.writer, "[{}] {}", timestamp, message)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Display dynamic progress information (overwrite previous line)
    pub fn progress(&mut self, message: &str) -> std::io::Result<()> {
        if !self.last_progress.is_empty() {
            print!("\r{}", " ".repeat(self.last_progress.len()));
        }
        print!("\r{}", message);
        std::io::stdout().flush()?;
        self.last_progress = message.to_string();
        Ok(())
    }

    /// Finish progress display
    pub fn finish_progress(&mut self) -> std::io::Result<()> {
        if !self.last_progress.is_empty() {
            println!();
            self.last_progress.clear();
        }
        Ok(())
    }

    /// Record log and display progress simultaneously
    pub fn log_and_progress(&mut self, message: &str) -> std::io::Result<()> {
        self.log(message)?;
        self.progress(message)?;
        Ok(())
    }
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply row scaling (z-score) to a matrix CSV
    Scale(scale::ScaleArgs),
    /// Hierarchically cluster one axis, output leaf order and merges
    Cluster(cluster::ClusterArgs),
    /// Run the full pipeline and draw a heatmap image
    Render(render::RenderArgs),
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Scale(args) => {
            let log_file = if let Some(log_path) = &args.log {
                std::fs::File::create(log_path)?
            } else {
                std::fs::File::create("scale.log")?
            };
            let mut logger = Logger::new(log_file);
            scale::scale_csv(&args, &mut logger)
        }
        Commands::Cluster(args) => {
            let log_file = if let Some(log_path) = &args.log {
                std::fs::File::create(log_path)?
            } else {
                std::fs::File::create("cluster.log")?
            };
            let mut logger = Logger::new(log_file);
            cluster::cluster_csv(&args, &mut logger)
        }
        Commands::Render(args) => {
            let log_file = if let Some(log_path) = &args.log {
                std::fs::File::create(log_path)?
            } else {
                std::fs::File::create("render.log")?
            };
            let mut logger = Logger::new(log_file);
            render::render_heatmap(&args, &mut logger)
        }
    }
}
