mod engine;
mod mocks;
mod pipeline;
