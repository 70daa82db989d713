//! About the matrix operations and the random matrices used for initialization.

use std::f64::consts::PI;
use ndarray::{Array1, Array2, Axis, array};
use ndarray_rand::RandomExt;
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::{StandardNormal, Uniform};





/// Random 3d rotation from three Euler angles
pub fn rand_rot<R: Rng + ?Sized>(rng: &mut R) -> Array2<f64>
{
    let alpha: f64 = rng.sample(Uniform::new(0.0, 2.0 * PI));
    let beta: f64 = rng.sample(Uniform::new(0.0, 2.0 * PI));
    let gamma: f64 = rng.sample(Uniform::new(0.0, 2.0 * PI));

    return array![[alpha.cos()*gamma.cos() - beta.cos()*alpha.sin()*gamma.sin(), -beta.cos()*gamma.cos()*alpha.sin() - alpha.cos()*gamma.sin(), alpha.sin()*beta.sin()],
                  [gamma.cos()*alpha.sin() + alpha.cos()*beta.cos()*gamma.sin(), alpha.cos()*beta.cos()*gamma.cos() - alpha.sin()*gamma.sin(), -alpha.cos()*beta.sin()],
                  [beta.sin()*gamma.sin(), gamma.cos()*beta.sin(), beta.cos()]]
}





/// Random orthogonal matrix of any dimension, by Gram-Schmidt orthonormalization of Gaussian columns
pub fn rand_orthogonal<R: Rng + ?Sized>(dim: usize, rng: &mut R) -> Array2<f64>
{
    let mut q: Array2<f64> = Array2::zeros((dim, dim));
    let mut k: usize = 0;
    while k < dim
    {
        let mut v: Array1<f64> = Array1::random_using(dim, StandardNormal, rng);
        for j in 0..k
        {
            let proj: f64 = q.column(j).dot(&v);
            v.scaled_add(-proj, &q.column(j));
        }
        let norm: f64 = v.dot(&v).sqrt();
        // Resample the (almost) linearly dependent draws
        if norm < 1e-8
        {
            continue
        }
        q.index_axis_mut(Axis(1), k).assign(&(v / norm));
        k += 1;
    }
    q
}





/// Matrix with entries drawn from N(0, std^2) and redrawn when beyond 'truncation' standard deviations
pub fn truncated_normal<R: Rng + ?Sized>(shape: (usize, usize), std: f64, truncation: f64, rng: &mut R) -> Array2<f64>
{
    Array2::from_shape_simple_fn(shape, ||
    {
        loop
        {
            let z: f64 = rng.sample(StandardNormal);
            if z.abs() <= truncation
            {
                return z * std
            }
        }
    })
}
