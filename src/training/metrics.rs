//! Evaluation metrics over collected predictions.

use crate::data::{Label, TaskMode};
use crate::error::{OctError, Result};
use crate::training::selection::MetricTriple;
use serde::{Deserialize, Serialize};

/// Model output for one visit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub visit_index: usize,
    pub label: Label,
    /// Class probabilities, per-finding probabilities, or the regressed value
    pub scores: Vec<f32>,
}

/// Regression statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub r2: f64,
    pub explained_variance: f64,
    pub mse: f64,
    pub mae: f64,
}

/// ROC AUC via the rank statistic, averaging ranks over ties
pub fn roc_auc(positive: &[bool], scores: &[f32]) -> Result<f64> {
    let n_pos = positive.iter().filter(|&&p| p).count();
    let n_neg = positive.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return Err(OctError::DegenerateEvaluation(
            "only one class present in labels; ROC AUC is undefined".to_string(),
        ));
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut rank_sum_pos = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // ranks are 1-based; tied block shares the mean rank
        let mean_rank = (i + j) as f64 / 2.0 + 1.0;
        for &k in &order[i..=j] {
            if positive[k] {
                rank_sum_pos += mean_rank;
            }
        }
        i = j + 1;
    }

    let n_pos = n_pos as f64;
    let n_neg = n_neg as f64;
    Ok((rank_sum_pos - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg))
}

/// Average precision: sum over thresholds of `(R_n - R_{n-1}) * P_n`
pub fn average_precision(positive: &[bool], scores: &[f32]) -> Result<f64> {
    let n_pos = positive.iter().filter(|&&p| p).count();
    if n_pos == 0 || n_pos == positive.len() {
        return Err(OctError::DegenerateEvaluation(
            "only one class present in labels; average precision is undefined".to_string(),
        ));
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut tp = 0usize;
    let mut seen = 0usize;
    let mut prev_recall = 0.0;
    let mut ap = 0.0;
    let mut i = 0;
    while i < order.len() {
        let threshold = scores[order[i]];
        while i < order.len() && scores[order[i]] == threshold {
            if positive[order[i]] {
                tp += 1;
            }
            seen += 1;
            i += 1;
        }
        let recall = tp as f64 / n_pos as f64;
        let precision = tp as f64 / seen as f64;
        ap += (recall - prev_recall) * precision;
        prev_recall = recall;
    }
    Ok(ap)
}

/// Mean recall over the classes present in `truth`
pub fn balanced_accuracy(truth: &[usize], predicted: &[usize]) -> f64 {
    let num_classes = truth.iter().copied().max().map_or(0, |m| m + 1);
    let mut hits = vec![0usize; num_classes];
    let mut totals = vec![0usize; num_classes];
    for (&t, &p) in truth.iter().zip(predicted) {
        totals[t] += 1;
        if t == p {
            hits[t] += 1;
        }
    }
    let recalls: Vec<f64> = totals
        .iter()
        .zip(&hits)
        .filter(|(&total, _)| total > 0)
        .map(|(&total, &hit)| hit as f64 / total as f64)
        .collect();
    if recalls.is_empty() {
        0.0
    } else {
        recalls.iter().sum::<f64>() / recalls.len() as f64
    }
}

fn argmax(scores: &[f32]) -> usize {
    scores
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map_or(0, |(i, _)| i)
}

fn single_label_metrics(predictions: &[Prediction]) -> Result<MetricTriple> {
    let truth: Vec<usize> = predictions
        .iter()
        .map(|p| match p.label {
            Label::Class(c) => Ok(c),
            _ => Err(OctError::MetadataInconsistency(
                "class label expected for single-label evaluation".to_string(),
            )),
        })
        .collect::<Result<_>>()?;
    let predicted: Vec<usize> = predictions.iter().map(|p| argmax(&p.scores)).collect();
    let num_classes = predictions.first().map_or(0, |p| p.scores.len());

    let acc = truth.iter().zip(&predicted).filter(|(t, p)| t == p).count() as f64
        / truth.len() as f64;
    let bal_acc = balanced_accuracy(&truth, &predicted);

    let (auc, auprc) = if num_classes == 2 {
        let positive: Vec<bool> = truth.iter().map(|&t| t == 1).collect();
        let scores: Vec<f32> = predictions.iter().map(|p| p.scores[1]).collect();
        (roc_auc(&positive, &scores)?, average_precision(&positive, &scores)?)
    } else {
        let mut aucs = Vec::with_capacity(num_classes);
        let mut aps = Vec::with_capacity(num_classes);
        for c in 0..num_classes {
            let positive: Vec<bool> = truth.iter().map(|&t| t == c).collect();
            let scores: Vec<f32> = predictions.iter().map(|p| p.scores[c]).collect();
            aucs.push(roc_auc(&positive, &scores)?);
            aps.push(average_precision(&positive, &scores)?);
        }
        (mean(&aucs), mean(&aps))
    };

    Ok(MetricTriple { auc, acc, auprc, bal_acc: Some(bal_acc) })
}

fn multi_label_metrics(predictions: &[Prediction]) -> Result<MetricTriple> {
    let width = predictions.first().map_or(0, |p| p.scores.len());
    let truth: Vec<Vec<bool>> = predictions
        .iter()
        .map(|p| match &p.label {
            Label::MultiHot(v) if v.len() == width => Ok(v.iter().map(|&x| x > 0.5).collect()),
            _ => Err(OctError::MetadataInconsistency(
                "indicator vector of matching width expected".to_string(),
            )),
        })
        .collect::<Result<_>>()?;

    let mut aucs = Vec::with_capacity(width);
    let mut aps = Vec::with_capacity(width);
    for col in 0..width {
        let positive: Vec<bool> = truth.iter().map(|t| t[col]).collect();
        let scores: Vec<f32> = predictions.iter().map(|p| p.scores[col]).collect();
        aucs.push(roc_auc(&positive, &scores)?);
        aps.push(average_precision(&positive, &scores)?);
    }

    let total = (predictions.len() * width) as f64;
    let correct = predictions
        .iter()
        .zip(&truth)
        .flat_map(|(p, t)| p.scores.iter().zip(t).map(|(&s, &y)| (s > 0.5) == y))
        .filter(|&ok| ok)
        .count() as f64;

    Ok(MetricTriple {
        auc: mean(&aucs),
        acc: correct / total,
        auprc: mean(&aps),
        bal_acc: None,
    })
}

/// R², explained variance, MSE and MAE
pub fn regression_metrics(predictions: &[Prediction]) -> Result<RegressionMetrics> {
    let n = predictions.len() as f64;
    let pairs: Vec<(f64, f64)> = predictions
        .iter()
        .map(|p| {
            let y = match p.label {
                Label::Value(v) => v as f64,
                _ => return Err(OctError::MetadataInconsistency("continuous target expected".into())),
            };
            Ok((y, p.scores.first().copied().unwrap_or(0.0) as f64))
        })
        .collect::<Result<_>>()?;

    let y_mean = pairs.iter().map(|(y, _)| y).sum::<f64>() / n;
    let ss_tot: f64 = pairs.iter().map(|(y, _)| (y - y_mean).powi(2)).sum();
    if ss_tot == 0.0 {
        return Err(OctError::DegenerateEvaluation(
            "constant regression targets; R2 is undefined".to_string(),
        ));
    }
    let residuals: Vec<f64> = pairs.iter().map(|(y, p)| y - p).collect();
    let ss_res: f64 = residuals.iter().map(|r| r * r).sum();
    let r_mean = residuals.iter().sum::<f64>() / n;
    let r_var = residuals.iter().map(|r| (r - r_mean).powi(2)).sum::<f64>() / n;

    Ok(RegressionMetrics {
        r2: 1.0 - ss_res / ss_tot,
        explained_variance: 1.0 - r_var / (ss_tot / n),
        mse: ss_res / n,
        mae: residuals.iter().map(|r| r.abs()).sum::<f64>() / n,
    })
}

/// Metrics the selection logic consumes, for any task mode
pub fn evaluate_predictions(task_mode: TaskMode, predictions: &[Prediction]) -> Result<MetricTriple> {
    if predictions.is_empty() {
        return Err(OctError::DegenerateEvaluation("no predictions to evaluate".to_string()));
    }
    match task_mode {
        TaskMode::BinaryCls | TaskMode::MultiCls => single_label_metrics(predictions),
        TaskMode::MultiLabel | TaskMode::MultiTask | TaskMode::MultiTaskDefault => {
            multi_label_metrics(predictions)
        }
        TaskMode::Regression => {
            let r = regression_metrics(predictions)?;
            Ok(MetricTriple {
                auc: r.explained_variance,
                acc: r.mae,
                auprc: r.r2,
                bal_acc: Some(r.mse),
            })
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Population mean and standard deviation
pub fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    (m, var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary(labels: &[usize], p1: &[f32]) -> Vec<Prediction> {
        labels
            .iter()
            .zip(p1)
            .enumerate()
            .map(|(i, (&l, &p))| Prediction {
                visit_index: i,
                label: Label::Class(l),
                scores: vec![1.0 - p, p],
            })
            .collect()
    }

    #[test]
    fn test_roc_auc() {
        let pos = [false, false, true, true];
        assert!((roc_auc(&pos, &[0.1, 0.4, 0.35, 0.8]).unwrap() - 0.75).abs() < 1e-9);
        assert!((roc_auc(&pos, &[0.5, 0.5, 0.5, 0.5]).unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_average_precision() {
        let pos = [false, false, true, true];
        let ap = average_precision(&pos, &[0.1, 0.4, 0.35, 0.8]).unwrap();
        assert!((ap - 0.833_333_333).abs() < 1e-6);
    }

    #[test]
    fn test_single_class_is_degenerate() {
        let preds = binary(&[1, 1, 1], &[0.2, 0.6, 0.9]);
        let err = evaluate_predictions(TaskMode::BinaryCls, &preds).unwrap_err();
        assert!(err.is_fold_scoped());
    }

    #[test]
    fn test_binary_metrics() {
        let preds = binary(&[0, 0, 1, 1], &[0.1, 0.6, 0.7, 0.9]);
        let m = evaluate_predictions(TaskMode::BinaryCls, &preds).unwrap();
        assert!((m.auc - 1.0).abs() < 1e-9);
        assert!((m.auprc - 1.0).abs() < 1e-9);
        assert!((m.acc - 0.75).abs() < 1e-9);
        assert!((m.bal_acc.unwrap() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_multi_label_metrics() {
        let preds = vec![
            Prediction { visit_index: 0, label: Label::MultiHot(vec![1.0, 0.0]), scores: vec![0.9, 0.2] },
            Prediction { visit_index: 1, label: Label::MultiHot(vec![0.0, 1.0]), scores: vec![0.3, 0.8] },
            Prediction { visit_index: 2, label: Label::MultiHot(vec![0.0, 1.0]), scores: vec![0.6, 0.4] },
        ];
        let m = evaluate_predictions(TaskMode::MultiLabel, &preds).unwrap();
        assert!((m.auc - 1.0).abs() < 1e-9);
        assert!((m.acc - 4.0 / 6.0).abs() < 1e-9);
        assert!(m.bal_acc.is_none());
    }

    #[test]
    fn test_regression_mapping() {
        let preds: Vec<Prediction> = [(1.0, 1.0), (2.0, 2.5), (3.0, 2.5)]
            .iter()
            .enumerate()
            .map(|(i, &(y, p))| Prediction { visit_index: i, label: Label::Value(y), scores: vec![p] })
            .collect();
        let r = regression_metrics(&preds).unwrap();
        assert!((r.mse - 1.0 / 6.0).abs() < 1e-9);
        assert!((r.r2 - 0.75).abs() < 1e-9);

        let m = evaluate_predictions(TaskMode::Regression, &preds).unwrap();
        assert_eq!(m.auprc, r.r2);
        assert_eq!(m.acc, r.mae);
        assert_eq!(m.bal_acc, Some(r.mse));
    }

    #[test]
    fn test_mean_std() {
        let (m, s) = mean_std(&[0.6, 0.8]);
        assert!((m - 0.7).abs() < 1e-12);
        assert!((s - 0.1).abs() < 1e-12);
    }
}
