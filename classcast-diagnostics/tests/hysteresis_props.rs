//! Property-based tests for adaptive quality hysteresis
//!
//! Samples are generated inside a known tier of the default threshold table,
//! so each property can reason about classifications directly.

use classcast_core::{ConnectionKey, QualitySample, QualityTier};
use classcast_diagnostics::{AdaptiveQualityController, TierDirection};
use proptest::prelude::*;

fn tier_strategy() -> impl Strategy<Value = QualityTier> {
    prop::sample::select(QualityTier::ALL.to_vec())
}

fn sample_in(tier: QualityTier) -> BoxedStrategy<QualitySample> {
    let (rtt, bandwidth, loss) = match tier {
        QualityTier::High => (0u32..151, 1_500u32..5_000, 0.0f32..0.02),
        QualityTier::Medium => (151u32..301, 500u32..1_500, 0.0f32..0.05),
        QualityTier::Low => (301u32..601, 150u32..500, 0.0f32..0.10),
        QualityTier::AudioOnly => (601u32..3_000, 0u32..150, 0.0f32..1.0),
    };
    (rtt, bandwidth, loss)
        .prop_map(|(rtt, bandwidth, loss)| {
            let key = ConnectionKey::new("s1".into(), "student".into());
            QualitySample::new(&key, rtt, bandwidth, loss)
        })
        .boxed()
}

/// A tier satisfying `keep`, paired with a sample drawn from it
fn tiered_sample(keep: impl Fn(QualityTier) -> bool) -> BoxedStrategy<(QualityTier, QualitySample)> {
    let tiers: Vec<QualityTier> = QualityTier::ALL.into_iter().filter(|t| keep(*t)).collect();
    prop::sample::select(tiers)
        .prop_flat_map(|t| (Just(t), sample_in(t)))
        .boxed()
}

fn any_sample() -> impl Strategy<Value = QualitySample> {
    tier_strategy().prop_flat_map(sample_in)
}

/// Current tier that still has a worse tier beneath it, plus a worse sample
fn downgrade_case() -> impl Strategy<Value = (QualityTier, (QualityTier, QualitySample))> {
    prop::sample::select(vec![QualityTier::High, QualityTier::Medium, QualityTier::Low])
        .prop_flat_map(|current| (Just(current), tiered_sample(move |t| t < current)))
}

/// Current tier that can still improve, a sample at that tier and two better ones
fn stalled_upgrade_case() -> impl Strategy<
    Value = (
        QualityTier,
        QualitySample,
        (QualityTier, QualitySample),
        (QualityTier, QualitySample),
    ),
> {
    prop::sample::select(vec![QualityTier::Medium, QualityTier::Low, QualityTier::AudioOnly])
        .prop_flat_map(|current| {
            (
                Just(current),
                sample_in(current),
                tiered_sample(move |t| t > current),
                tiered_sample(move |t| t > current),
            )
        })
}

proptest! {
    /// Generated samples land in the tier they were drawn from
    #[test]
    fn samples_classify_into_their_tier((tier, sample) in tiered_sample(|_| true)) {
        let controller = AdaptiveQualityController::default();
        prop_assert_eq!(controller.classify(&sample), tier);
    }

    /// A single worse sample always downgrades at once, whatever came before
    #[test]
    fn downgrade_is_never_delayed(
        history in prop::collection::vec(any_sample(), 0..12),
        (current, (bad_tier, bad)) in downgrade_case(),
    ) {
        let controller = AdaptiveQualityController::default();

        let mut window = history;
        window.push(bad);
        let change = controller.evaluate(current, &window);

        prop_assert!(change.is_some());
        let change = change.unwrap();
        prop_assert_eq!(change.to, bad_tier);
        prop_assert_eq!(change.direction, TierDirection::Downgrade);
    }

    /// Two improving samples after a steady one never upgrade
    #[test]
    fn two_improving_samples_do_not_upgrade(
        history in prop::collection::vec(any_sample(), 0..12),
        (current, base, (_, s1), (_, s2)) in stalled_upgrade_case(),
    ) {
        let controller = AdaptiveQualityController::default();

        let mut window = history;
        window.push(base);
        window.push(s1);
        prop_assert!(controller.evaluate(current, &window).is_none());
        window.push(s2);
        prop_assert!(controller.evaluate(current, &window).is_none());
    }

    /// Three improving samples upgrade to the weakest of them
    #[test]
    fn sustained_improvement_upgrades(
        (current, run) in prop::sample::select(
            vec![QualityTier::Medium, QualityTier::Low, QualityTier::AudioOnly],
        )
        .prop_flat_map(|current| {
            (
                Just(current),
                prop::collection::vec(tiered_sample(move |t| t > current), 3),
            )
        }),
    ) {
        let controller = AdaptiveQualityController::default();

        let expected = run.iter().map(|(t, _)| *t).min().unwrap();
        let window: Vec<QualitySample> = run.into_iter().map(|(_, s)| s).collect();
        let change = controller.evaluate(current, &window).unwrap();

        prop_assert_eq!(change.to, expected);
        prop_assert_eq!(change.direction, TierDirection::Upgrade);
    }
}
