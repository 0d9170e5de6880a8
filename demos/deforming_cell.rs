use env_logger::Builder;
use log::info;
use mdspace::space::periodic_general::PeriodicGeneral;
use mdspace::utils::sampling::{gaussian, uniform_positions};
use mdspace::{distance, BoundaryConfig, CellTransform, Space};
use ndarray::{array, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;

const N: usize = 8;
const STEPS: usize = 5;
const DT: f64 = 0.2;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Programmatically set the logging level
    Builder::new().filter_level(log::LevelFilter::Debug).init();

    let mut rng = StdRng::seed_from_u64(2019);

    // A square cell of side 5 that shears while it is compressed along y
    let sheared = array![[5.0, 0.0], [1.5, 4.0]];
    let square = array![[5.0, 0.0], [0.0, 5.0]];
    let cell = CellTransform::linear_interpolation(sheared, square)?;
    let space = PeriodicGeneral::new(cell)?;

    let mut r = uniform_positions(&mut rng, N, 2);
    for step in 0..=STEPS {
        let t = step as f64 * DT;
        let dr = space.displacement(&r, &r, Some(t))?;
        let dist = distance(&dr)?;
        let nearest = dist
            .iter()
            .copied()
            .filter(|&d| d > 0.0)
            .fold(f64::INFINITY, f64::min);
        info!("t = {:.2}: nearest pair at {:.4}", t, nearest);

        let kick: Array2<f64> = gaussian(&mut rng, N, 2, 0.1)?;
        r = space.shift(&r, &kick, Some(t))?;
    }

    // The same kind of cell, read back from its JSON description
    let config: BoundaryConfig = serde_json::from_str(
        r#"{"kind": "periodic_general_interpolated",
            "transform_0": [[5.0, 0.0], [1.5, 4.0]],
            "transform_1": [[5.0, 0.0], [0.0, 5.0]]}"#,
    )?;
    let boundary = config.build()?;
    let dist = boundary.distance(&r, &r, Some(1.0))?;
    info!("Final distances:\n{:.3}", dist);

    Ok(())
}
