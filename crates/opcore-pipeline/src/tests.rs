mod attributes;
mod deposits;
mod fixtures;
mod l1_info_encode;
