use std::io::{self, Write};

/// In-place console progress bar for the drawing loop.
pub struct ProgressBar {
    total: usize,
    current: usize,
    width: usize,
    last_percentage: usize,
}

impl ProgressBar {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            current: 0,
            width: 50,
            last_percentage: 0,
        }
    }

    /// Update progress; the bar is redrawn only when the percentage changes.
    pub fn update(&mut self, current: usize) -> io::Result<()> {
        self.current = current;
        let percentage = if self.total > 0 {
            (current * 100) / self.total
        } else {
            0
        };
        if percentage != self.last_percentage {
            self.display()?;
            self.last_percentage = percentage;
        }
        Ok(())
    }

    fn display(&self) -> io::Result<()> {
        let percentage = if self.total > 0 {
            (self.current * 100) / self.total
        } else {
            0
        };
        let filled_width = if self.total > 0 {
            (self.current * self.width) / self.total
        } else {
            0
        };
        let bar = "█".repeat(filled_width);
        let empty = "░".repeat(self.width - filled_width);
        print!(
            "\r[{}] {}% ({}/{})",
            bar + &empty,
            percentage,
            self.current,
            self.total
        );
        io::stdout().flush()?;
        Ok(())
    }

    pub fn finish(&mut self) -> io::Result<()> {
        self.current = self.total;
        self.display()?;
        println!();
        Ok(())
    }
}

/// Format elapsed time as "xx h xx m xx.xxx s".
pub fn format_time_used(elapsed: std::time::Duration) -> String {
    let total_secs = elapsed.as_secs_f64();
    let hours = (total_secs / 3600.0) as u64;
    let minutes = ((total_secs % 3600.0) / 60.0) as u64;
    let seconds = total_secs % 60.0;

    if hours > 0 {
        format!("[Time used] {:02} h {:02} m {:05.3} s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("[Time used] {:02} m {:05.3} s", minutes, seconds)
    } else {
        format!("[Time used] {:05.3} s", seconds)
    }
}
