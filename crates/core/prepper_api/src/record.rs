/// The unit of data moved between the stages of a pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record<T> {
    data: T,
}

impl<T> Record<T> {
    pub fn new(data: T) -> Self {
        Record { data }
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut T {
        &mut self.data
    }

    pub fn into_data(self) -> T {
        self.data
    }
}

impl<T> From<T> for Record<T> {
    fn from(data: T) -> Self {
        Record::new(data)
    }
}
