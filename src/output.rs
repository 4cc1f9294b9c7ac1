use std::io::{self, Write};

/// Fixed-grid trajectory serializer.
///
/// Each row is `t,s_0,s_1,...,s_{n-1},` followed by a newline; the format is
/// the same for every solver. The buffer remembers the last timeline index it
/// wrote, so a solver that jumps across several grid points emits one row per
/// covered index, all carrying the state it committed. At trajectory end a
/// terminal status integer is written on its own line.
pub struct OutputBuffer<W: Write> {
    sink: W,
    timeline: Vec<f64>,
    output_interval: usize,
    last_timestep: usize,
}

impl<W: Write> OutputBuffer<W> {
    /// `output_interval` controls flush cadence and is clamped into
    /// `(0, timeline.len()]`; zero means "flush whole trajectories".
    pub fn new(sink: W, timeline: Vec<f64>, output_interval: usize) -> Self {
        let output_interval = if output_interval == 0 || output_interval > timeline.len() {
            timeline.len()
        } else {
            output_interval
        };
        OutputBuffer {
            sink,
            timeline,
            output_interval,
            last_timestep: 0,
        }
    }

    /// The output grid.
    pub fn timeline(&self) -> &[f64] {
        &self.timeline
    }

    /// Number of grid points per trajectory.
    pub fn number_timesteps(&self) -> usize {
        self.timeline.len()
    }

    /// Prepares for a new trajectory.
    pub fn reset(&mut self) {
        self.last_timestep = 0;
    }

    /// Next timeline index that has not been written yet.
    pub fn next_unwritten(&self) -> usize {
        self.last_timestep
    }

    /// Writes one row per timeline index from the last unwritten index
    /// through `next_timestep` inclusive, each carrying `state`. Indices
    /// already written are skipped.
    pub fn write_range(&mut self, next_timestep: usize, state: &[f64]) -> io::Result<()> {
        let next_timestep = next_timestep.min(self.timeline.len() - 1);
        while self.last_timestep <= next_timestep {
            let t = self.timeline[self.last_timestep];
            write!(self.sink, "{t}")?;
            for x in state {
                write!(self.sink, ",{x}")?;
            }
            writeln!(self.sink, ",")?;

            if self.last_timestep % self.output_interval == 0 {
                self.sink.flush()?;
            }
            self.last_timestep += 1;
        }
        Ok(())
    }

    /// Writes exactly the next unwritten row.
    pub fn write_current(&mut self, state: &[f64]) -> io::Result<()> {
        self.write_range(self.last_timestep, state)
    }

    /// Terminal token for the current trajectory.
    pub fn write_final(&mut self, status: u8) -> io::Result<()> {
        writeln!(self.sink, "{status}")?;
        self.sink.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(n: usize, end: f64) -> Vec<f64> {
        (0..n).map(|i| i as f64 * end / (n - 1) as f64).collect()
    }

    #[test]
    fn rows_cover_the_requested_range_once() {
        let mut buf = OutputBuffer::new(Vec::new(), grid(5, 4.0), 1);
        buf.write_current(&[10.0]).unwrap();
        buf.write_range(3, &[7.0]).unwrap();
        // Re-requesting an already-written index is a no-op.
        buf.write_range(2, &[99.0]).unwrap();
        buf.write_range(4, &[5.0]).unwrap();
        buf.write_final(0).unwrap();

        let text = String::from_utf8(buf.sink).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec!["0,10,", "1,7,", "2,7,", "3,7,", "4,5,", "0"]
        );
    }

    #[test]
    fn range_is_clamped_to_the_grid() {
        let mut buf = OutputBuffer::new(Vec::new(), grid(3, 2.0), 1);
        buf.write_range(100, &[1.0]).unwrap();
        let text = String::from_utf8(buf.sink).unwrap();
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn timeline_is_strictly_increasing() {
        let timeline = grid(21, 20.0);
        assert!(timeline.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(timeline[20], 20.0);
    }
}
