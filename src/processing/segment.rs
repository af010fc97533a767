//! Stationary-segment detection over a distance series
//!
//! A segment is a run of samples whose forward rolling deviation stays at or
//! below a threshold, i.e. a period where the tag stood still.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub start: usize,
    pub len: usize,
    pub mean: f64,
    /// Middle sample of the run
    pub representative: usize,
}

/// Population standard deviation of `series[i..min(i + window, n)]` for every `i`
pub fn rolling_deviation(series: &[f64], window: usize) -> Vec<f64> {
    let window = window.max(1);
    (0..series.len())
        .map(|start| {
            let slice = &series[start..(start + window).min(series.len())];
            let count = slice.len() as f64;
            let mean = slice.iter().sum::<f64>() / count;
            let variance = slice.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / count;
            variance.sqrt()
        })
        .collect()
}

/// Maximal runs where `deviations[i] <= threshold`
pub fn segments(series: &[f64], deviations: &[f64], threshold: f64) -> Vec<Segment> {
    let mut found = Vec::new();
    let mut run_start: Option<usize> = None;

    let close = |start: usize, end: usize, found: &mut Vec<Segment>| {
        let len = end - start;
        let mean = series[start..end].iter().sum::<f64>() / len as f64;
        found.push(Segment {
            start,
            len,
            mean,
            representative: start + len / 2,
        });
    };

    let n = series.len().min(deviations.len());
    for (i, deviation) in deviations.iter().enumerate().take(n) {
        match (run_start, *deviation <= threshold) {
            (None, true) => run_start = Some(i),
            (Some(start), false) => {
                close(start, i, &mut found);
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = run_start {
        close(start, n, &mut found);
    }
    found
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segmenter {
    pub window: usize,
    pub threshold: f64,
}

impl Default for Segmenter {
    fn default() -> Self {
        Self {
            window: 10,
            threshold: 0.02,
        }
    }
}

impl Segmenter {
    pub fn new(window: usize, threshold: f64) -> Self {
        Self { window, threshold }
    }

    pub fn split(&self, series: &[f64]) -> Vec<Segment> {
        let deviations = rolling_deviation(series, self.window);
        segments(series, &deviations, self.threshold)
    }
}
