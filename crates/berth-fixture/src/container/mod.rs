//! Container specifications and fixture lifecycle.

mod fixture;
mod spec;

pub use fixture::{ContainerFixture, FixtureState, ReadinessRetry};
pub use spec::{ContainerImage, FixtureSpec, FixtureSpecBuilder, ImagePullPolicy, WaitStrategy};
