use serde::Serialize;
use unicode_segmentation::UnicodeSegmentation;

/// Character Error Rate (CER) and Word Error Rate (WER) of one transcription.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AccuracyMetrics {
    pub cer: f64,
    pub wer: f64,
}

impl AccuracyMetrics {
    pub fn calculate(ground_truth: &str, predicted: &str) -> Self {
        Self {
            cer: character_error_rate(ground_truth, predicted),
            wer: word_error_rate(ground_truth, predicted),
        }
    }
}

/// Edit distance over graphemes divided by the reference length.
pub fn character_error_rate(ground_truth: &str, predicted: &str) -> f64 {
    let reference: Vec<&str> = ground_truth.graphemes(true).collect();
    let hypothesis: Vec<&str> = predicted.graphemes(true).collect();
    error_rate(&reference, &hypothesis)
}

/// Edit distance over whitespace separated words divided by the reference word count.
pub fn word_error_rate(ground_truth: &str, predicted: &str) -> f64 {
    let reference: Vec<&str> = ground_truth.split_whitespace().collect();
    let hypothesis: Vec<&str> = predicted.split_whitespace().collect();
    error_rate(&reference, &hypothesis)
}

fn error_rate<T: Eq>(reference: &[T], hypothesis: &[T]) -> f64 {
    if reference.is_empty() {
        return if hypothesis.is_empty() { 0.0 } else { 1.0 };
    }

    levenshtein_distance(reference, hypothesis) as f64 / reference.len() as f64
}

/// Levenshtein distance with a single rolling row.
pub fn levenshtein_distance<T: Eq>(a: &[T], b: &[T]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, left) in a.iter().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, right) in b.iter().enumerate() {
            let cost = usize::from(left != right);
            let next = (row[j + 1] + 1).min(row[j] + 1).min(diagonal + cost);
            diagonal = row[j + 1];
            row[j + 1] = next;
        }
    }

    row[b.len()]
}

/// Running CER/WER over a stream of (ground truth, prediction) pairs.
#[derive(Debug, Clone, Default)]
pub struct BatchAccuracy {
    count: usize,
    total_cer: f64,
    total_wer: f64,
    max_cer: f64,
    max_wer: f64,
}

impl BatchAccuracy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, ground_truth: &str, predicted: &str) -> AccuracyMetrics {
        let metrics = AccuracyMetrics::calculate(ground_truth, predicted);
        self.count += 1;
        self.total_cer += metrics.cer;
        self.total_wer += metrics.wer;
        self.max_cer = self.max_cer.max(metrics.cer);
        self.max_wer = self.max_wer.max(metrics.wer);
        metrics
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn average_cer(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_cer / self.count as f64
        }
    }

    pub fn average_wer(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_wer / self.count as f64
        }
    }

    pub fn max_cer(&self) -> f64 {
        self.max_cer
    }

    pub fn max_wer(&self) -> f64 {
        self.max_wer
    }

    pub fn meets_thresholds(&self, max_cer: f64, max_wer: f64) -> bool {
        self.average_cer() <= max_cer && self.average_wer() <= max_wer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_accuracy() {
        let metrics = AccuracyMetrics::calculate("a move to stop", "a move to stop");
        assert_eq!(metrics.cer, 0.0);
        assert_eq!(metrics.wer, 0.0);
    }

    #[test]
    fn test_single_substitution() {
        let metrics = AccuracyMetrics::calculate("hello", "hxllo");
        assert_eq!(metrics.cer, 0.2);
        assert_eq!(metrics.wer, 1.0);
    }

    #[test]
    fn test_word_level_insertion() {
        let metrics = AccuracyMetrics::calculate("the cat sat", "the fat cat sat");
        assert_eq!(metrics.wer, 1.0 / 3.0);
        assert_eq!(metrics.cer, 4.0 / 11.0);
    }

    #[test]
    fn test_empty_cases() {
        assert_eq!(AccuracyMetrics::calculate("", "").cer, 0.0);
        assert_eq!(AccuracyMetrics::calculate("", "abc").cer, 1.0);
        assert_eq!(AccuracyMetrics::calculate("abc", "").cer, 1.0);
    }

    #[test]
    fn test_levenshtein_distance() {
        let a: Vec<char> = "kitten".chars().collect();
        let b: Vec<char> = "sitting".chars().collect();
        assert_eq!(levenshtein_distance(&a, &b), 3);
        assert_eq!(levenshtein_distance(&b, &a), 3);
    }

    #[test]
    fn test_batch_accuracy_averages() {
        let mut batch = BatchAccuracy::new();
        batch.push("abcd", "abcd");
        batch.push("abcd", "abxd");
        assert_eq!(batch.count(), 2);
        assert_eq!(batch.average_cer(), 0.125);
        assert_eq!(batch.max_cer(), 0.25);
        assert_eq!(batch.average_wer(), 0.5);
        assert!(batch.meets_thresholds(0.2, 0.5));
        assert!(!batch.meets_thresholds(0.1, 1.0));
    }
}
