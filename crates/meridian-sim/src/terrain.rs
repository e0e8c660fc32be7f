//! Multi-octave fBm height field the simulator's datasets are sampled from.

use noise::{NoiseFn, Simplex};

/// Parameters of the fractal Brownian motion sum.
#[derive(Clone, Debug)]
pub struct TerrainParams {
    pub seed: u32,
    pub octaves: u32,
    /// Frequency multiplier between successive octaves.
    pub lacunarity: f64,
    /// Amplitude multiplier between successive octaves.
    pub persistence: f64,
    pub base_frequency: f64,
    pub amplitude: f64,
}

impl Default for TerrainParams {
    fn default() -> Self {
        Self {
            seed: 7,
            octaves: 5,
            lacunarity: 2.0,
            persistence: 0.5,
            base_frequency: 0.004,
            amplitude: 120.0,
        }
    }
}

/// Deterministic height field over the XY plane.
pub struct Terrain {
    noise: Simplex,
    params: TerrainParams,
}

impl Terrain {
    pub fn new(params: TerrainParams) -> Self {
        Self {
            noise: Simplex::new(params.seed),
            params,
        }
    }

    /// Height at `(x, y)`; always within `±max_height()`.
    pub fn height(&self, x: f64, y: f64) -> f64 {
        let mut total = 0.0;
        let mut frequency = self.params.base_frequency;
        let mut amplitude = self.params.amplitude;
        for _ in 0..self.params.octaves {
            total += self.noise.get([x * frequency, y * frequency]) * amplitude;
            frequency *= self.params.lacunarity;
            amplitude *= self.params.persistence;
        }
        total
    }

    /// Upper bound of `|height|` over the whole plane.
    pub fn max_height(&self) -> f64 {
        (0..self.params.octaves)
            .map(|i| self.params.amplitude * self.params.persistence.powi(i as i32))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Same seed, same terrain.
    #[test]
    fn test_deterministic() {
        let a = Terrain::new(TerrainParams::default());
        let b = Terrain::new(TerrainParams::default());
        for (x, y) in [(0.0, 0.0), (123.4, -56.7), (1000.0, 1000.0)] {
            assert_eq!(a.height(x, y), b.height(x, y));
        }
    }

    #[test]
    fn test_height_bounded() {
        let terrain = Terrain::new(TerrainParams::default());
        let bound = terrain.max_height();
        assert!((bound - 120.0 * (1.0 + 0.5 + 0.25 + 0.125 + 0.0625)).abs() < 1e-9);
        for i in 0..200 {
            let h = terrain.height(f64::from(i) * 7.3, f64::from(i) * -3.1);
            assert!(h.abs() <= bound);
        }
    }
}
