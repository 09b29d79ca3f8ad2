//! CRUD and domain services over the work-lifecycle schema (§4.1, §4.2).

pub mod car;
pub mod dep;

pub use car::{
    CarDetail, CarError, CarService, ChildrenSummary, CreateCarOpts, ListCarFilters, UpdateCar,
};
pub use dep::{CarDeps, DepError, DependencyService};
