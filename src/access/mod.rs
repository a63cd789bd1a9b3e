// Access control for paid content: bearer token verification and the subscription gate.

pub mod gate;
pub mod token;
