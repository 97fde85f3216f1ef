/*!
Markov chain Monte Carlo over a batched density interface:
Metropolis-Hastings (fixed and adaptive), Hamiltonian Monte Carlo (fixed
and dual-averaging-tuned), the No-U-Turn Sampler, and multi-channel
drivers that mix local moves with importance jumps between modes. Direct
uniform and rejection samplers plus a weighted sample container round
out the toolkit.
*/

pub mod core;
pub mod density;
pub mod distributions;
pub mod errors;
pub mod hamilton;
#[cfg(feature = "csv")]
pub mod io;
pub mod mc3;
pub mod metropolis;
pub mod nuts;
pub mod sample;
pub mod stats;
