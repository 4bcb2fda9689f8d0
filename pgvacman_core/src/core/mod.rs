pub mod applier;
pub mod catalog;
pub mod matching;
pub mod quoting;
pub mod report;
pub mod rules;
pub mod run;
pub mod scheduler;
pub mod session;
pub mod stats;
