use std::sync::Arc;
use tracing::warn;

use crate::page::Page;
use crate::types::CacheError;
use crate::util::FrugalQuantileEstimator;

/// Estimator step: tokens are integers, half a token is fine-grained enough
const ESTIMATOR_STEP: f64 = 0.5;

/// Gathers the least useful idle pages seen during one maintenance scan
///
/// Every page's local tokens are fed through a frugal quantile estimator; a
/// page qualifies if it is USABLE, unused and at or below the current estimate
/// of the target percentile. Owned by the housekeeper, never shared.
pub(crate) struct ReclaimCollector {
    estimator: FrugalQuantileEstimator,
    clean: Vec<Arc<Page>>,
    dirty: Vec<Arc<Page>>,
}

impl ReclaimCollector {
    pub fn new(percent_to_reclaim: u32) -> Self {
        Self::with_estimator(FrugalQuantileEstimator::new(
            percent_to_reclaim,
            ESTIMATOR_STEP,
            0.0,
        ))
    }

    pub fn with_estimator(estimator: FrugalQuantileEstimator) -> Self {
        Self {
            estimator,
            clean: Vec::new(),
            dirty: Vec::new(),
        }
    }

    /// Forget the previous turn's candidates and retarget the estimator
    pub fn start_collecting_turn(&mut self, percent_to_reclaim: u32) {
        self.clean.clear();
        self.dirty.clear();
        self.estimator.update_target_percentile(percent_to_reclaim);
    }

    pub fn check_page_good_for_reclaim(&mut self, page: &Arc<Page>) {
        let tokens = page.local_tokens();
        let threshold = self.estimator.update_estimation(tokens as f64);
        // the 100th percentile is the maximum: every page is at or below it
        let low_usefulness =
            self.estimator.percentile_to_estimate() >= 100 || tokens as f64 <= threshold;
        if page.is_usable() && page.usage_count() == 0 && low_usefulness {
            if page.is_dirty() {
                self.dirty.push(Arc::clone(page));
            } else {
                self.clean.push(Arc::clone(page));
            }
        }
    }

    /// Candidates in reclaim order: clean by ascending tokens, then dirty
    pub fn finish_collecting_turn(&mut self) -> Vec<Arc<Page>> {
        self.clean.sort_by_key(|page| page.local_tokens());
        self.dirty.sort_by_key(|page| page.local_tokens());
        self.clean.iter().chain(self.dirty.iter()).cloned().collect()
    }

    /// Candidates collected by the last turn
    pub fn pages_prepared(&self) -> usize {
        self.clean.len() + self.dirty.len()
    }

    pub fn low_usefulness_threshold(&self) -> f64 {
        self.estimator.current_estimation()
    }

    /// Flush least useful dirty candidates until at least `clean_ratio` of
    /// all candidates is clean
    ///
    /// Skips pages whose content lock is busy. Returns the number of pages
    /// flushed and the first flush error, if any.
    pub fn ensure_enough_clean_pages(&mut self, clean_ratio: f64) -> (usize, Option<CacheError>) {
        let total = self.pages_prepared();
        let wanted_clean = (total as f64 * clean_ratio).ceil() as usize;
        let mut missing = wanted_clean.saturating_sub(self.clean.len());
        let mut flushed = 0;
        let mut first_error = None;

        for page in &self.dirty {
            if missing == 0 {
                break;
            }
            match page.try_flush() {
                Ok(true) => {
                    flushed += 1;
                    missing -= 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        page_index = page.page_index(),
                        error = %e,
                        "page_cache.eager_flush_failed"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        (flushed, first_error)
    }
}
