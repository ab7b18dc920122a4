//! Compute a DP sum with privately inferred bounds.

use dpagg::prelude::*;
use dpagg::Algorithm;

fn main() -> dpagg::Result<()> {
    let mut sum = BoundedSum::<f64>::builder()
        .with_epsilon(1.0)
        .with_max_partitions_contributed(1)
        .with_max_contributions_per_partition(1)
        .build()?;

    for value in (0..1000).map(|i| (i % 20) as f64 - 5.0) {
        sum.add_entry(value);
    }

    let output = sum.partial_result()?;
    println!("noised sum: {:.3}", output.elements[0].value.as_f64());
    if let Some(report) = output.error_report.and_then(|r| r.bounding_report) {
        println!(
            "inferred bounds: [{}, {}] ({} of {} inputs clamped)",
            report.lower, report.upper, report.num_outside_inputs, report.num_inputs
        );
    }
    Ok(())
}
